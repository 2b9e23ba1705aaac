use std::ffi::{CString, c_int};
use std::ptr;

use ffmpeg_next::{Dictionary, Rational, ffi, format};

use crate::{
    error::{MuxError, Result},
    io::WriteIo,
    packet::RawPacket,
    stream::AvStream,
};

/// Muxer writing into a [`WriteIo`].
///
/// The AVIO context is borrowed: it is detached again on drop so FFmpeg does
/// not close it, and it must outlive this value.
pub struct AvOutput {
    inner: format::context::Output,
    /// Input stream index -> output stream index.
    stream_map: Vec<Option<usize>>,
}

impl AvOutput {
    pub fn new(io: &WriteIo, format_name: &str) -> Result<Self> {
        let cname = CString::new(format_name)
            .map_err(|_| MuxError::OutputFormat(format_name.to_string()))?;
        let inner = unsafe {
            let mut ps = ptr::null_mut();
            let ret = ffi::avformat_alloc_output_context2(
                &mut ps,
                ptr::null(),
                cname.as_ptr(),
                ptr::null(),
            );
            if ret < 0 || ps.is_null() {
                return Err(MuxError::OutputFormat(format_name.to_string()));
            }
            (*ps).pb = io.as_mut_ptr();
            (*ps).flags |= (ffi::AVFMT_FLAG_CUSTOM_IO
                | ffi::AVFMT_FLAG_NOBUFFER
                | ffi::AVFMT_FLAG_FLUSH_PACKETS) as c_int;
            format::context::Output::wrap(ps)
        };
        Ok(Self {
            inner,
            stream_map: Vec::new(),
        })
    }

    /// Adds an output stream copying `stream`'s codec parameters.
    pub fn add_stream(&mut self, stream: &AvStream) -> Result<usize> {
        let codec_parameters = stream.parameters();
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(codec_parameters.id()))
            .map_err(MuxError::AddStream)?;
        writer_stream.set_parameters(codec_parameters.clone());
        writer_stream.set_time_base(stream.time_base());
        unsafe {
            // the input's tag may not be valid in the output container
            (*(*writer_stream.as_mut_ptr()).codecpar).codec_tag = 0;
        }
        let out_index = writer_stream.index();

        if self.stream_map.len() <= stream.index() {
            self.stream_map.resize(stream.index() + 1, None);
        }
        self.stream_map[stream.index()] = Some(out_index);
        Ok(out_index)
    }

    pub fn write_header(&mut self, options: Dictionary) -> Result<()> {
        self.inner
            .write_header_with(options)
            .map_err(MuxError::WriteHeader)
    }

    /// Output index for an input stream, if it was mirrored.
    pub fn output_index(&self, input_index: usize) -> Option<usize> {
        self.stream_map.get(input_index).copied().flatten()
    }

    /// Time base the muxer settled on. Only final after the header is written.
    pub fn stream_time_base(&self, output_index: usize) -> Option<Rational> {
        self.inner.stream(output_index).map(|s| s.time_base())
    }

    /// Writes one packet and flushes it straight through to the I/O layer.
    /// Timestamps must already be in the output stream's time base.
    pub fn write_packet(&mut self, output_index: usize, packet: &mut RawPacket) -> Result<()> {
        let p = packet.get_mut();
        p.set_stream(output_index);
        p.set_position(-1);
        p.write(&mut self.inner).map_err(MuxError::WritePacket)?;

        let ret = unsafe { ffi::av_write_frame(self.inner.as_mut_ptr(), ptr::null_mut()) };
        if ret < 0 {
            return Err(MuxError::WritePacket(ffmpeg_next::Error::from(ret)));
        }
        Ok(())
    }
}

impl Drop for AvOutput {
    fn drop(&mut self) {
        unsafe {
            (*self.inner.as_mut_ptr()).pb = ptr::null_mut();
        }
    }
}
