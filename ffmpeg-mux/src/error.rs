//! Error types for the remux pipeline.
//!
//! Errors fall into two classes. Recoverable ones (a rejected chunk, a failed
//! per-frame read or write) are counted and the pipeline keeps running.
//! Fatal ones end the current session: the owner has to tear the pipeline
//! down and build a new one.

pub type Result<T> = core::result::Result<T, MuxError>;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// A chunk handed to the frame buffer that can never be stored.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// FFmpeg could not allocate a context or an I/O buffer.
    #[error("failed to allocate {0}")]
    Alloc(&'static str),

    /// The output container format is unknown to the linked FFmpeg.
    #[error("output format not available: {0}")]
    OutputFormat(String),

    #[error("could not open input as {format}: {source}")]
    OpenInput {
        format: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("unable to find stream info: {0}")]
    StreamInfo(#[source] ffmpeg_next::Error),

    #[error("input has no streams")]
    NoStreams,

    #[error("no decoder for codec {0:?}")]
    DecoderNotFound(ffmpeg_next::codec::Id),

    #[error("failed to add output stream: {0}")]
    AddStream(#[source] ffmpeg_next::Error),

    #[error("error writing header: {0}")]
    WriteHeader(#[source] ffmpeg_next::Error),

    #[error("error reading packet: {0}")]
    ReadPacket(#[source] ffmpeg_next::Error),

    #[error("error writing packet: {0}")]
    WritePacket(#[source] ffmpeg_next::Error),

    #[error("failed to spawn muxer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl MuxError {
    /// True when the current session cannot continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            MuxError::InvalidArgument(_) | MuxError::ReadPacket(_) | MuxError::WritePacket(_) => {
                false
            }
            MuxError::Alloc(_)
            | MuxError::OutputFormat(_)
            | MuxError::OpenInput { .. }
            | MuxError::StreamInfo(_)
            | MuxError::NoStreams
            | MuxError::DecoderNotFound(_)
            | MuxError::AddStream(_)
            | MuxError::WriteHeader(_)
            | MuxError::Spawn(_) => true,
        }
    }
}
