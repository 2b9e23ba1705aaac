//! Memory-backed AVIO contexts.
//!
//! FFmpeg pulls demuxer input from the shared [`FrameBuffer`] through
//! [`ReadIo`] and pushes muxer output into a [`SegmentFramer`] through
//! [`WriteIo`]. Both callbacks only ever run on the muxer worker thread,
//! inside a demux or mux call made by that thread.

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use ffmpeg_next::{ffi, util::error::EINVAL};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::FrameBuffer,
    error::{MuxError, Result},
    segment::SegmentFramer,
};

struct ReadState {
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
    capacity: usize,
    /// Set by the pull callback when it discarded the accumulator.
    overflowed: bool,
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let state = unsafe { &mut *(opaque as *mut ReadState) };
    if buf.is_null() || buf_size <= 0 {
        return ffi::AVERROR(EINVAL);
    }

    let mut guard = state.buffer.wait_for_data(&state.cancel);
    if state.cancel.is_cancelled() {
        return ffi::AVERROR_EOF;
    }

    if guard.len() > state.capacity {
        let dropped = guard.drop_all();
        state.overflowed = true;
        log::debug!("reader cannot keep up, dropped {} frames", dropped);
        return 0;
    }

    let out = unsafe { std::slice::from_raw_parts_mut(buf, buf_size as usize) };
    guard.drain_into(out) as c_int
}

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    let framer = unsafe { &mut *(opaque as *mut SegmentFramer) };
    if !buf.is_null() && buf_size > 0 {
        let bytes = unsafe { std::slice::from_raw_parts(buf, buf_size as usize) };
        framer.push(bytes);
    }
    buf_size
}

type ReadFn = unsafe extern "C" fn(*mut c_void, *mut u8, c_int) -> c_int;
type WriteFn = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;

fn alloc_context(
    size: usize,
    opaque: *mut c_void,
    read: Option<ReadFn>,
    write: Option<WriteFn>,
) -> Result<*mut ffi::AVIOContext> {
    let size = size.min(c_int::MAX as usize);
    let buf = unsafe { ffi::av_malloc(size) as *mut u8 };
    if buf.is_null() {
        return Err(MuxError::Alloc("I/O buffer"));
    }
    let write_flag = write.is_some() as c_int;
    let ctx = unsafe {
        ffi::avio_alloc_context(buf, size as c_int, write_flag, opaque, read, write, None)
    };
    if ctx.is_null() {
        unsafe { ffi::av_free(buf as *mut c_void) };
        return Err(MuxError::Alloc("I/O context"));
    }
    Ok(ctx)
}

/// FFmpeg may have swapped the buffer, so free whatever the context holds now.
unsafe fn free_context(ctx: &mut *mut ffi::AVIOContext) {
    if ctx.is_null() {
        return;
    }
    unsafe {
        ffi::av_freep(&mut (**ctx).buffer as *mut *mut u8 as *mut c_void);
        ffi::avio_context_free(ctx);
    }
}

/// Pull side of the adapter.
pub struct ReadIo {
    ctx: *mut ffi::AVIOContext,
    state: *mut ReadState,
}

impl ReadIo {
    /// `size` bounds both the AVIO buffer and the accumulated size the pull
    /// callback accepts before it drops everything.
    pub fn new(buffer: Arc<FrameBuffer>, cancel: CancellationToken, size: usize) -> Result<Self> {
        let state = Box::into_raw(Box::new(ReadState {
            buffer,
            cancel,
            capacity: size,
            overflowed: false,
        }));
        match alloc_context(size, state as *mut c_void, Some(read_packet), None) {
            Ok(ctx) => Ok(Self { ctx, state }),
            Err(e) => {
                drop(unsafe { Box::from_raw(state) });
                Err(e)
            }
        }
    }

    pub fn as_mut_ptr(&self) -> *mut ffi::AVIOContext {
        self.ctx
    }

    /// Called after a demux call. If the pull callback dropped data, the
    /// bytes FFmpeg still holds are stale: discard them and clear the
    /// end-of-stream mark so the next pull starts fresh.
    pub fn recover_after_drop(&mut self) -> bool {
        let state = unsafe { &mut *self.state };
        if !std::mem::take(&mut state.overflowed) {
            return false;
        }
        unsafe {
            ffi::avio_flush(self.ctx);
            (*self.ctx).eof_reached = 0;
            (*self.ctx).error = 0;
        }
        true
    }
}

impl Drop for ReadIo {
    fn drop(&mut self) {
        unsafe {
            free_context(&mut self.ctx);
            drop(Box::from_raw(self.state));
        }
    }
}

/// Push side of the adapter. Owns the framer the write callback feeds.
pub struct WriteIo {
    ctx: *mut ffi::AVIOContext,
    framer: *mut SegmentFramer,
}

impl WriteIo {
    pub fn new(framer: SegmentFramer, size: usize) -> Result<Self> {
        let framer = Box::into_raw(Box::new(framer));
        match alloc_context(size, framer as *mut c_void, None, Some(write_packet)) {
            Ok(ctx) => Ok(Self { ctx, framer }),
            Err(e) => {
                drop(unsafe { Box::from_raw(framer) });
                Err(e)
            }
        }
    }

    pub fn as_mut_ptr(&self) -> *mut ffi::AVIOContext {
        self.ctx
    }

    /// Must not be held across a call into FFmpeg that can write.
    pub fn framer(&mut self) -> &mut SegmentFramer {
        unsafe { &mut *self.framer }
    }
}

impl Drop for WriteIo {
    fn drop(&mut self) {
        unsafe {
            free_context(&mut self.ctx);
            drop(Box::from_raw(self.framer));
        }
    }
}

/// Raw pointers keep these `!Send`; they only move once, into the worker.
unsafe impl Send for ReadIo {}
unsafe impl Send for WriteIo {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(io: &ReadIo, out: &mut [u8]) -> c_int {
        unsafe { read_packet(io.state as *mut c_void, out.as_mut_ptr(), out.len() as c_int) }
    }

    #[test]
    fn test_pull_over_capacity_drops_everything() -> anyhow::Result<()> {
        let buffer = Arc::new(FrameBuffer::new(64));
        let mut io = ReadIo::new(buffer.clone(), CancellationToken::new(), 16)?;
        for _ in 0..3 {
            buffer.write(&[7u8; 8])?;
        }

        let mut out = [0u8; 16];
        assert_eq!(pull(&io, &mut out), 0);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.statistics().fails, 3);

        assert!(io.recover_after_drop());
        assert!(!io.recover_after_drop());
        Ok(())
    }

    #[test]
    fn test_pull_keeps_what_does_not_fit() -> anyhow::Result<()> {
        let buffer = Arc::new(FrameBuffer::new(64));
        let mut io = ReadIo::new(buffer.clone(), CancellationToken::new(), 16)?;
        buffer.write(&[1, 2, 3, 4, 5, 6])?;

        let mut out = [0u8; 4];
        assert_eq!(pull(&io, &mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buffer.size(), 2);
        assert_eq!(buffer.statistics().fails, 0);
        assert!(!io.recover_after_drop());
        Ok(())
    }

    #[test]
    fn test_pull_after_shutdown_is_end_of_stream() -> anyhow::Result<()> {
        let buffer = Arc::new(FrameBuffer::new(64));
        let cancel = CancellationToken::new();
        let io = ReadIo::new(buffer.clone(), cancel.clone(), 16)?;
        buffer.shutdown(&cancel);

        let mut out = [0u8; 4];
        assert_eq!(pull(&io, &mut out), ffi::AVERROR_EOF);
        Ok(())
    }
}
