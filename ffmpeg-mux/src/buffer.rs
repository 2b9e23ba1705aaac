use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::{
    error::{MuxError, Result},
    stats::FrameStatistics,
};

/// Default accumulator size, roughly 5MB.
pub const DEFAULT_CAPACITY: usize = 5_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Appended,
    /// The chunk did not fit, everything held before it was dropped.
    Overflowed { dropped: u64 },
}

struct Inner {
    data: Box<[u8]>,
    end: usize,
    /// Chunks stored since the last reset.
    frames: u64,
    /// Chunks stored over the buffer's lifetime.
    sequence: u64,
    stats: FrameStatistics,
}

impl Inner {
    fn reset(&mut self) {
        self.end = 0;
        self.frames = 0;
    }

    fn drop_all(&mut self) -> u64 {
        let dropped = self.frames;
        self.stats.fails += dropped;
        self.reset();
        dropped
    }
}

/// Fixed-capacity byte accumulator shared by one producer and one consumer.
///
/// The producer is the hardware callback thread, the consumer is the muxer
/// worker. Both sides serialize on the same lock, and the consumer sleeps on
/// a condition variable tied to that lock until data arrives or shutdown is
/// requested.
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    data_available: Condvar,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                end: 0,
                frames: 0,
                sequence: 0,
                stats: FrameStatistics::default(),
            }),
            data_available: Condvar::new(),
            capacity,
        }
    }

    /// Appends a chunk and wakes the consumer.
    pub fn write(&self, data: &[u8]) -> Result<WriteOutcome> {
        self.write_with(data, true)
    }

    /// Appends a chunk, resetting the whole buffer first if it does not fit.
    ///
    /// The copy happens under the lock. A chunk larger than the capacity is
    /// rejected without touching the buffer or its counters; an empty chunk
    /// is a no-op.
    pub fn write_with(&self, data: &[u8], signal: bool) -> Result<WriteOutcome> {
        if data.len() > self.capacity {
            return Err(MuxError::InvalidArgument(format!(
                "chunk of {} bytes exceeds buffer capacity {}",
                data.len(),
                self.capacity
            )));
        }
        if data.is_empty() {
            return Ok(WriteOutcome::Appended);
        }

        let mut inner = self.lock_inner();
        inner.stats.attempts += 1;

        let outcome = if data.len() > self.capacity - inner.end {
            let dropped = inner.drop_all();
            log::warn!(
                "frame buffer full, dropped {} frames to fit {} bytes",
                dropped,
                data.len()
            );
            WriteOutcome::Overflowed { dropped }
        } else {
            WriteOutcome::Appended
        };

        let start = inner.end;
        inner.data[start..start + data.len()].copy_from_slice(data);
        inner.end += data.len();
        inner.frames += 1;
        inner.sequence += 1;

        if outcome == WriteOutcome::Appended {
            inner.stats.record_write(Instant::now());
        }

        if signal {
            self.data_available.notify_one();
        }
        Ok(outcome)
    }

    /// Empties the buffer. Statistics are left alone.
    pub fn clear(&self) {
        self.lock_inner().reset();
    }

    /// Starts a fresh measurement epoch without discarding stored bytes.
    pub fn clear_write_counts(&self) {
        self.lock_inner().stats = FrameStatistics::default();
    }

    pub fn size(&self) -> usize {
        self.lock_inner().end
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.lock_inner().end
    }

    pub fn statistics(&self) -> FrameStatistics {
        self.lock_inner().stats
    }

    /// Adds frames lost downstream (e.g. refused by the publish path).
    pub fn record_failures(&self, count: u64) {
        if count > 0 {
            self.lock_inner().stats.fails += count;
        }
    }

    /// Locks the buffer for direct access to its contents.
    pub fn lock(&self) -> FrameBufferGuard<'_> {
        FrameBufferGuard {
            inner: self.lock_inner(),
            capacity: self.capacity,
        }
    }

    /// Blocks until the buffer holds data or `cancel` fires.
    ///
    /// Spurious wakeups are absorbed here; callers still check `cancel`
    /// after this returns.
    pub fn wait_for_data(&self, cancel: &CancellationToken) -> FrameBufferGuard<'_> {
        let mut inner = self.lock_inner();
        while inner.end == 0 && !cancel.is_cancelled() {
            inner = self
                .data_available
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        FrameBufferGuard {
            inner,
            capacity: self.capacity,
        }
    }

    /// Blocks until a chunk newer than `seen` (see
    /// [`FrameBufferGuard::sequence`]) is stored or `cancel` fires.
    pub fn wait_for_write(&self, cancel: &CancellationToken, seen: u64) -> FrameBufferGuard<'_> {
        let mut inner = self.lock_inner();
        while inner.sequence == seen && !cancel.is_cancelled() {
            inner = self
                .data_available
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        FrameBufferGuard {
            inner,
            capacity: self.capacity,
        }
    }

    /// Cancels `cancel` under the lock and wakes every waiter, so a consumer
    /// about to sleep cannot miss the request.
    pub fn shutdown(&self, cancel: &CancellationToken) {
        let _inner = self.lock_inner();
        cancel.cancel();
        self.data_available.notify_all();
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Locked view of a [`FrameBuffer`]. The producer is blocked while it lives.
pub struct FrameBufferGuard<'a> {
    inner: MutexGuard<'a, Inner>,
    capacity: usize,
}

impl FrameBufferGuard<'_> {
    pub fn len(&self) -> usize {
        self.inner.end
    }

    pub fn is_empty(&self) -> bool {
        self.inner.end == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.inner.end
    }

    /// Number of chunks ever stored, for use with [`FrameBuffer::wait_for_write`].
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// The valid region, `[begin, end)`.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.data[..self.inner.end]
    }

    pub fn clear(&mut self) {
        self.inner.reset();
    }

    /// Discards the contents and books every held frame as failed.
    pub fn drop_all(&mut self) -> u64 {
        self.inner.drop_all()
    }

    /// Moves as many bytes as fit into `out` and returns the count. Bytes
    /// that do not fit are shifted to the front and stay buffered.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let inner = &mut *self.inner;
        let n = inner.end.min(out.len());
        out[..n].copy_from_slice(&inner.data[..n]);
        if n == inner.end {
            inner.reset();
        } else {
            inner.data.copy_within(n..inner.end, 0);
            inner.end -= n;
        }
        n
    }
}
