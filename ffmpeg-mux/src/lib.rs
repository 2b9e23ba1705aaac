//! Real-time re-muxing of camera elementary streams into fragmented MP4.
//!
//! A hardware callback writes encoded chunks into a [`FrameBuffer`]; a
//! [`Muxer`] worker thread drains it through FFmpeg and publishes tagged
//! init and media segments to a [`PublishSink`].

/// Registers FFmpeg components and sets its log level. Call once at startup.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);
    Ok(())
}

pub mod buffer;
pub mod error;
pub mod input;
pub mod io;
pub mod muxer;
pub mod output;
pub mod packet;
pub mod segment;
pub mod sink;
pub mod stats;
pub mod stream;

pub use buffer::{FrameBuffer, WriteOutcome};
pub use error::{MuxError, Result};
pub use muxer::{Muxer, MuxerConfig, PipelineState};
pub use segment::{Segment, SegmentKind};
pub use sink::{BroadcastSink, PublishError, PublishSink};
pub use stats::{FrameStatistics, HealthStats};
