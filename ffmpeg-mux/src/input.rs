use std::ffi::c_int;
use std::ptr;

use ffmpeg_next::{
    codec::packet::Packet, ffi, format, util::mathematics::rescale::TIME_BASE,
};

use crate::{
    error::{MuxError, Result},
    io::ReadIo,
    packet::RawPacket,
    stream::AvStream,
};

/// Guesses the container or elementary stream format of `sample`.
///
/// Only a confident match counts: anything scoring at or below a quarter of
/// the maximum probe score is treated as unknown.
pub fn probe_format(sample: &[u8]) -> Option<format::Input> {
    if sample.is_empty() {
        return None;
    }
    let padding = ffi::AVPROBE_PADDING_SIZE as usize;
    let mut padded = Vec::with_capacity(sample.len() + padding);
    padded.extend_from_slice(sample);
    padded.resize(sample.len() + padding, 0);

    let probe = ffi::AVProbeData {
        filename: c"".as_ptr(),
        buf: padded.as_mut_ptr(),
        buf_size: sample.len().min(c_int::MAX as usize) as c_int,
        mime_type: ptr::null(),
    };
    let mut score = ffi::AVPROBE_SCORE_MAX as c_int / 4;
    let fmt = unsafe { ffi::av_probe_input_format2(&probe, 1, &mut score) };
    if fmt.is_null() {
        return None;
    }
    log::debug!("probe score {}", score);
    Some(unsafe { format::format::Input::wrap(fmt as *mut _) })
}

/// Demuxer reading from a [`ReadIo`].
///
/// The AVIO context is borrowed, not owned: it must outlive this value.
pub struct AvInput {
    inner: format::context::Input,
    streams: Vec<AvStream>,
}

impl AvInput {
    /// Opens the input as `format`, resolves stream info and makes sure
    /// every stream has a decoder.
    pub fn open(io: &ReadIo, format: &format::Input) -> Result<Self> {
        let inner = unsafe {
            let mut ps = ffi::avformat_alloc_context();
            if ps.is_null() {
                return Err(MuxError::Alloc("input context"));
            }
            (*ps).pb = io.as_mut_ptr();
            (*ps).flags |= (ffi::AVFMT_FLAG_CUSTOM_IO | ffi::AVFMT_FLAG_NOBUFFER) as c_int;

            // frees the context on failure
            let ret = ffi::avformat_open_input(&mut ps, ptr::null(), format.as_ptr(), ptr::null_mut());
            if ret < 0 {
                return Err(MuxError::OpenInput {
                    format: format.name().to_string(),
                    source: ffmpeg_next::Error::from(ret),
                });
            }
            format::context::Input::wrap(ps)
        };

        let mut input = Self {
            inner,
            streams: Vec::new(),
        };
        input.find_stream_info()?;
        Ok(input)
    }

    fn find_stream_info(&mut self) -> Result<()> {
        let ret = unsafe { ffi::avformat_find_stream_info(self.inner.as_mut_ptr(), ptr::null_mut()) };
        if ret < 0 {
            return Err(MuxError::StreamInfo(ffmpeg_next::Error::from(ret)));
        }

        self.streams = self.inner.streams().map(AvStream::from).collect();
        if self.streams.is_empty() {
            return Err(MuxError::NoStreams);
        }
        for stream in &self.streams {
            if ffmpeg_next::decoder::find(stream.codec_id()).is_none() {
                return Err(MuxError::DecoderNotFound(stream.codec_id()));
            }
            log::info!("input stream {}", stream);
        }
        Ok(())
    }

    pub fn streams(&self) -> &[AvStream] {
        &self.streams
    }

    /// Pulls the next packet. Blocks inside the read callback until the
    /// producer delivers more data.
    pub fn read_packet(&mut self) -> Result<RawPacket> {
        let mut packet = Packet::empty();
        packet.read(&mut self.inner).map_err(MuxError::ReadPacket)?;
        let time_base = self
            .streams
            .get(packet.stream())
            .map(|s| s.time_base())
            .unwrap_or(TIME_BASE);
        Ok((packet, time_base).into())
    }
}
