use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use ffmpeg_mux::{FrameBuffer, WriteOutcome};
use tokio_util::sync::CancellationToken;

use crate::nal;

/// Metadata the hardware attaches to every delivered chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Hardware buffer holding the chunk; must be released once copied.
    pub buf_index: u32,
    /// Capture time in microseconds, source clock.
    pub timestamp: u64,
}

/// Hands hardware buffers back to the source.
pub trait BufferRelease {
    fn release(&self, channel: u32, buf_index: u32);
}

/// A camera delivering encoded video per channel on its own thread.
pub trait HardwareSource: BufferRelease + Send + Sync {
    /// Installs the handler for `channel`, replacing any previous one.
    fn register(&self, channel: u32, handler: ChunkHandler) -> anyhow::Result<()>;
    fn unregister(&self, channel: u32);
    fn start(&self, channel: u32) -> anyhow::Result<()>;
    fn stop(&self, channel: u32);
    fn is_alive(&self, channel: u32) -> bool;
}

/// Per-channel delivery context, owned by the source once registered.
pub struct ChunkHandler {
    channel: u32,
    buffer: Arc<FrameBuffer>,
}

impl ChunkHandler {
    pub fn new(channel: u32, buffer: Arc<FrameBuffer>) -> Self {
        Self { channel, buffer }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Runs on the source's thread. Copies the chunk and returns the
    /// hardware buffer right away; never waits on the muxer.
    pub fn on_chunk(&self, source: &dyn BufferRelease, data: &[u8], info: ChunkInfo) {
        log::trace!(
            "channel {}: {} bytes in buffer {} at {}us",
            self.channel,
            data.len(),
            info.buf_index,
            info.timestamp
        );
        match self.buffer.write(data) {
            Ok(WriteOutcome::Appended) => {}
            Ok(WriteOutcome::Overflowed { dropped }) => {
                log::debug!("channel {}: buffer overflow dropped {} frames", self.channel, dropped);
            }
            Err(e) => log::warn!("channel {}: {}", self.channel, e),
        }
        source.release(self.channel, info.buf_index);
    }
}

/// Hardware buffers handed out and not yet released, keyed by channel.
#[derive(Default)]
struct InFlight {
    buffers: Mutex<HashSet<(u32, u32)>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<(u32, u32)>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self, channel: u32, buf_index: u32) -> bool {
        self.lock().insert((channel, buf_index))
    }

    fn outstanding(&self, channel: u32) -> usize {
        self.lock().iter().filter(|(c, _)| *c == channel).count()
    }
}

impl BufferRelease for InFlight {
    fn release(&self, channel: u32, buf_index: u32) {
        if !self.lock().remove(&(channel, buf_index)) {
            log::warn!("channel {}: release of buffer {} not in flight", channel, buf_index);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub path: PathBuf,
    pub fps: u32,
    pub looped: bool,
    /// Size of the simulated hardware buffer ring.
    pub buffer_count: u32,
}

struct ReplayWorker {
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    handler: Option<Arc<ChunkHandler>>,
    worker: Option<ReplayWorker>,
}

/// Simulated camera replaying an Annex B H.264 file, one picture per tick.
///
/// Each channel gets its own delivery thread. Like real hardware it does
/// not wait for consumers: if the buffer it is about to fill has not been
/// released yet, the picture is dropped.
pub struct ReplaySource {
    config: ReplayConfig,
    units: Arc<Vec<Bytes>>,
    slots: Mutex<HashMap<u32, Slot>>,
    in_flight: Arc<InFlight>,
}

impl ReplaySource {
    pub fn open(config: ReplayConfig) -> anyhow::Result<Self> {
        let data = std::fs::read(&config.path)
            .with_context(|| format!("reading replay file {}", config.path.display()))?;
        Self::from_bytes(config, &data)
    }

    pub fn from_bytes(config: ReplayConfig, data: &[u8]) -> anyhow::Result<Self> {
        let units = nal::access_units(data);
        if !nal::is_annexb(data) || units.is_empty() {
            anyhow::bail!("{}: no Annex B NAL units found", config.path.display());
        }
        anyhow::ensure!(config.fps > 0, "replay fps must be positive");
        anyhow::ensure!(config.buffer_count > 0, "replay needs at least one buffer");
        log::info!(
            "replay source {}: {} pictures at {} fps",
            config.path.display(),
            units.len(),
            config.fps
        );
        Ok(Self {
            config,
            units: Arc::new(units),
            slots: Mutex::new(HashMap::new()),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn outstanding(&self, channel: u32) -> usize {
        self.in_flight.outstanding(channel)
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<u32, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BufferRelease for ReplaySource {
    fn release(&self, channel: u32, buf_index: u32) {
        self.in_flight.release(channel, buf_index);
    }
}

impl HardwareSource for ReplaySource {
    fn register(&self, channel: u32, handler: ChunkHandler) -> anyhow::Result<()> {
        anyhow::ensure!(
            handler.channel() == channel,
            "handler for channel {} registered on channel {}",
            handler.channel(),
            channel
        );
        let mut slots = self.lock_slots();
        let slot = slots.entry(channel).or_default();
        anyhow::ensure!(
            slot.worker.is_none(),
            "channel {} is streaming, stop it before registering",
            channel
        );
        slot.handler = Some(Arc::new(handler));
        Ok(())
    }

    fn unregister(&self, channel: u32) {
        self.stop(channel);
        self.lock_slots().remove(&channel);
    }

    fn start(&self, channel: u32) -> anyhow::Result<()> {
        let mut slots = self.lock_slots();
        let slot = slots
            .get_mut(&channel)
            .with_context(|| format!("channel {} has no handler", channel))?;
        if slot.worker.as_ref().is_some_and(|w| w.alive.load(Ordering::Acquire)) {
            return Ok(());
        }
        let handler = slot
            .handler
            .clone()
            .with_context(|| format!("channel {} has no handler", channel))?;

        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let delivery = Delivery {
            channel,
            handler,
            units: self.units.clone(),
            in_flight: self.in_flight.clone(),
            interval: Duration::from_secs(1) / self.config.fps,
            looped: self.config.looped,
            buffer_count: self.config.buffer_count,
            cancel: cancel.clone(),
            alive: alive.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("replay-{}", channel))
            .spawn(move || delivery.run())
            .context("spawning replay thread")?;

        slot.worker = Some(ReplayWorker {
            cancel,
            alive,
            handle,
        });
        log::info!("replay channel {} started", channel);
        Ok(())
    }

    fn stop(&self, channel: u32) {
        let worker = self
            .lock_slots()
            .get_mut(&channel)
            .and_then(|slot| slot.worker.take());
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if worker.handle.join().is_err() {
                log::error!("replay channel {} thread panicked", channel);
            }
            log::info!(
                "replay channel {} stopped, {} buffers outstanding",
                channel,
                self.outstanding(channel)
            );
        }
    }

    fn is_alive(&self, channel: u32) -> bool {
        self.lock_slots()
            .get(&channel)
            .and_then(|slot| slot.worker.as_ref())
            .is_some_and(|w| w.alive.load(Ordering::Acquire))
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        let channels: Vec<u32> = self.lock_slots().keys().copied().collect();
        for channel in channels {
            self.stop(channel);
        }
    }
}

/// State moved into one channel's delivery thread.
struct Delivery {
    channel: u32,
    handler: Arc<ChunkHandler>,
    units: Arc<Vec<Bytes>>,
    in_flight: Arc<InFlight>,
    interval: Duration,
    looped: bool,
    buffer_count: u32,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl Delivery {
    fn run(self) {
        let start = Instant::now();
        let mut next_tick = start;
        let mut sequence: u64 = 0;

        'outer: loop {
            for unit in self.units.iter() {
                if self.cancel.is_cancelled() {
                    break 'outer;
                }

                let buf_index = (sequence % u64::from(self.buffer_count)) as u32;
                sequence += 1;
                if self.in_flight.acquire(self.channel, buf_index) {
                    let info = ChunkInfo {
                        buf_index,
                        timestamp: start.elapsed().as_micros() as u64,
                    };
                    self.handler.on_chunk(&*self.in_flight, unit, info);
                } else {
                    log::warn!(
                        "channel {}: buffer {} still held, dropping picture",
                        self.channel,
                        buf_index
                    );
                }

                next_tick += self.interval;
                let now = Instant::now();
                if next_tick > now {
                    std::thread::sleep(next_tick - now);
                } else {
                    next_tick = now;
                }
            }
            if !self.looped {
                break;
            }
        }

        self.alive.store(false, Ordering::Release);
        log::debug!("replay channel {} delivery finished", self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIP: &[u8] = &[
        0x00, 0x00, 0x00, 0x01, 0x67, 0x01, // sps
        0x00, 0x00, 0x00, 0x01, 0x68, 0x02, // pps
        0x00, 0x00, 0x00, 0x01, 0x65, 0x03, // idr
        0x00, 0x00, 0x00, 0x01, 0x41, 0x04, // p
        0x00, 0x00, 0x00, 0x01, 0x41, 0x05, // p
    ];

    fn replay_config(looped: bool) -> ReplayConfig {
        ReplayConfig {
            path: PathBuf::from("clip.h264"),
            fps: 200,
            looped,
            buffer_count: 4,
        }
    }

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<(u32, u32)>>,
    }

    impl BufferRelease for Recorder {
        fn release(&self, channel: u32, buf_index: u32) {
            self.released.lock().unwrap().push((channel, buf_index));
        }
    }

    #[test]
    fn test_handler_copies_then_releases() {
        let buffer = Arc::new(FrameBuffer::new(64));
        let handler = ChunkHandler::new(3, buffer.clone());
        let recorder = Recorder::default();

        handler.on_chunk(
            &recorder,
            &[1, 2, 3],
            ChunkInfo {
                buf_index: 7,
                timestamp: 0,
            },
        );

        assert_eq!(buffer.size(), 3);
        assert_eq!(*recorder.released.lock().unwrap(), vec![(3, 7)]);
    }

    #[test]
    fn test_handler_releases_rejected_chunk() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let handler = ChunkHandler::new(1, buffer.clone());
        let recorder = Recorder::default();

        handler.on_chunk(
            &recorder,
            &[1, 2, 3],
            ChunkInfo {
                buf_index: 0,
                timestamp: 0,
            },
        );

        assert_eq!(buffer.size(), 0);
        assert_eq!(recorder.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_non_annexb_file() {
        assert!(ReplaySource::from_bytes(replay_config(false), b"not a video").is_err());
    }

    #[test]
    fn test_replay_delivers_every_picture_once() -> anyhow::Result<()> {
        let source = ReplaySource::from_bytes(replay_config(false), CLIP)?;
        let buffer = Arc::new(FrameBuffer::new(1024));
        source.register(1, ChunkHandler::new(1, buffer.clone()))?;
        source.start(1)?;

        let deadline = Instant::now() + Duration::from_secs(2);
        while source.is_alive(1) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(!source.is_alive(1));
        assert_eq!(buffer.size(), CLIP.len());
        assert_eq!(buffer.statistics().attempts, 3);
        assert_eq!(source.outstanding(1), 0);
        Ok(())
    }

    #[test]
    fn test_stop_halts_looped_replay() -> anyhow::Result<()> {
        let source = ReplaySource::from_bytes(replay_config(true), CLIP)?;
        let buffer = Arc::new(FrameBuffer::new(1024));
        source.register(2, ChunkHandler::new(2, buffer))?;
        source.start(2)?;
        std::thread::sleep(Duration::from_millis(30));
        assert!(source.is_alive(2));

        source.stop(2);
        assert!(!source.is_alive(2));
        // a stopped channel can be started again
        source.start(2)?;
        assert!(source.is_alive(2));
        source.unregister(2);
        assert!(!source.is_alive(2));
        Ok(())
    }

    #[test]
    fn test_register_checks_channel() {
        let source = ReplaySource::from_bytes(replay_config(false), CLIP).unwrap();
        let buffer = Arc::new(FrameBuffer::new(16));
        assert!(source.register(1, ChunkHandler::new(2, buffer)).is_err());
        assert!(source.start(1).is_err());
    }
}
