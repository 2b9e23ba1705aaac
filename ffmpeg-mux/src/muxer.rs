use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use ffmpeg_next::Dictionary;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{DEFAULT_CAPACITY, FrameBuffer, FrameBufferGuard},
    error::{MuxError, Result},
    input::{AvInput, probe_format},
    io::{ReadIo, WriteIo},
    output::AvOutput,
    packet::WallClock,
    segment::SegmentFramer,
    sink::PublishSink,
    stats::{HealthStats, Telemetry},
};

#[derive(Debug, Clone)]
pub struct MuxerConfig {
    /// Names the worker thread and prefixes log lines.
    pub name: String,
    /// Bytes to accumulate before a format probe is attempted.
    pub probe_size: usize,
    pub buffer_capacity: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub format: String,
    pub movflags: String,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            name: "video".to_string(),
            probe_size: 300_000,
            buffer_capacity: DEFAULT_CAPACITY,
            read_buffer_size: 4_000_000,
            write_buffer_size: 4_000_000,
            format: "mp4".to_string(),
            movflags: "empty_moov+default_base_moof+frag_keyframe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ProbingFormat,
    FormatAcquired,
    Muxing,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::ProbingFormat => "probing_format",
            PipelineState::FormatAcquired => "format_acquired",
            PipelineState::Muxing => "muxing",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::ProbingFormat,
            2 => PipelineState::FormatAcquired,
            3 => PipelineState::Muxing,
            _ => PipelineState::Idle,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-owned values the owner may read.
#[derive(Default)]
struct Shared {
    state: AtomicU8,
    telemetry: Telemetry,
    fatal: Mutex<Option<String>>,
    running: AtomicBool,
}

impl Shared {
    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Clears `running` when the worker leaves, including by panic.
struct RunningGuard(Arc<Shared>);

impl RunningGuard {
    fn enter(shared: Arc<Shared>) -> Self {
        shared.running.store(true, Ordering::Release);
        Self(shared)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Re-muxes an elementary video stream into fragmented MP4.
///
/// The producer writes raw chunks into [`Muxer::buffer`]. A dedicated worker
/// thread probes the format, opens the demuxer over the buffer, writes the
/// container header and then remuxes packet by packet, handing every output
/// write to the [`PublishSink`] as a tagged segment.
///
/// Dropping the muxer stops and joins the worker; all FFmpeg state is
/// released on the worker thread before the join returns.
pub struct Muxer {
    name: String,
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Muxer {
    /// Allocates the I/O and output contexts and starts the worker. Any
    /// allocation failure is returned here and no thread is started.
    pub fn new(config: MuxerConfig, sink: Arc<dyn PublishSink>) -> Result<Self> {
        let buffer = Arc::new(FrameBuffer::new(config.buffer_capacity));
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::default());

        let worker = Worker::new(
            config.clone(),
            buffer.clone(),
            cancel.clone(),
            shared.clone(),
            sink,
        )?;

        let running = RunningGuard::enter(shared.clone());
        let handle = std::thread::Builder::new()
            .name(format!("mux-{}", config.name))
            .spawn(move || {
                let _running = running;
                worker.run();
            })
            .map_err(MuxError::Spawn)?;

        Ok(Self {
            name: config.name,
            buffer,
            cancel,
            shared,
            handle: Some(handle),
        })
    }

    /// Producer side of the pipeline.
    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn health(&self) -> HealthStats {
        self.shared.telemetry.load()
    }

    pub fn fps(&self) -> f32 {
        self.health().fps
    }

    pub fn dropped_frames(&self) -> u64 {
        self.health().dropped_frames
    }

    pub fn latency_micros(&self) -> u64 {
        self.health().latency_micros
    }

    /// The error that ended the session, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// False once the worker has exited, whether stopped or failed.
    pub fn is_alive(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Signals the worker and waits for it to exit. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.buffer.shutdown(&self.cancel);
        if handle.join().is_err() {
            log::error!("[{}] muxer worker panicked", self.name);
        }
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker thread owns. Field order is teardown order: the
/// demuxer and muxer go before the I/O contexts they read from and write to.
struct Worker {
    input: Option<AvInput>,
    output: AvOutput,
    read_io: ReadIo,
    write_io: WriteIo,
    config: MuxerConfig,
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    clock: WallClock,
    /// Last buffer sequence the probe looked at.
    seen: u64,
}

// FFmpeg contexts are only touched from the worker thread once moved there.
unsafe impl Send for Worker {}

impl Worker {
    fn new(
        config: MuxerConfig,
        buffer: Arc<FrameBuffer>,
        cancel: CancellationToken,
        shared: Arc<Shared>,
        sink: Arc<dyn PublishSink>,
    ) -> Result<Self> {
        let read_io = ReadIo::new(buffer.clone(), cancel.clone(), config.read_buffer_size)?;
        let write_io = WriteIo::new(SegmentFramer::new(sink), config.write_buffer_size)?;
        let output = AvOutput::new(&write_io, &config.format)?;
        Ok(Self {
            input: None,
            output,
            read_io,
            write_io,
            config,
            buffer,
            cancel,
            shared,
            clock: WallClock::new(Instant::now()),
            seen: 0,
        })
    }

    fn set_state(&self, state: PipelineState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn run(mut self) {
        let buffer = self.buffer.clone();
        let cancel = self.cancel.clone();

        self.set_state(PipelineState::ProbingFormat);
        log::info!(
            "[{}] muxer started, probing once {} bytes are buffered",
            self.config.name,
            self.config.probe_size
        );

        while !cancel.is_cancelled() {
            let result = match self.shared.state() {
                PipelineState::FormatAcquired => self.start_muxing(),
                // blocks inside the read callback until data or shutdown
                PipelineState::Muxing => self.mux_next(),
                PipelineState::Idle | PipelineState::ProbingFormat => {
                    let guard = buffer.wait_for_write(&cancel, self.seen);
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.seen = guard.sequence();
                    self.probe(guard)
                }
            };

            match result {
                Ok(()) => {}
                Err(_) if cancel.is_cancelled() => break,
                Err(e) if e.is_fatal() => {
                    log::error!("[{}] {}", self.config.name, e);
                    *self.shared.fatal.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(e.to_string());
                    break;
                }
                Err(e) => log::debug!("[{}] {}", self.config.name, e),
            }
        }

        log::info!("[{}] muxer stopped in state {}", self.config.name, self.shared.state());
    }

    fn probe(&mut self, mut guard: FrameBufferGuard<'_>) -> Result<()> {
        let len = guard.len();
        if len <= self.config.probe_size {
            return Ok(());
        }

        let Some(format) = probe_format(guard.as_slice()) else {
            log::debug!(
                "[{}] no format recognized in {} bytes, probing again",
                self.config.name,
                len
            );
            guard.clear();
            return Ok(());
        };
        drop(guard);

        log::info!(
            "[{}] detected input format {} ({})",
            self.config.name,
            format.name(),
            format.description()
        );
        let input = AvInput::open(&self.read_io, &format)?;
        self.read_io.recover_after_drop();
        self.input = Some(input);
        self.set_state(PipelineState::FormatAcquired);
        Ok(())
    }

    fn start_muxing(&mut self) -> Result<()> {
        let Some(input) = self.input.as_ref() else {
            return Err(MuxError::NoStreams);
        };
        for stream in input.streams() {
            let out_index = self.output.add_stream(stream)?;
            log::debug!(
                "[{}] mirroring input stream {} as output stream {}",
                self.config.name,
                stream.index(),
                out_index
            );
        }

        let mut options = Dictionary::new();
        options.set("movflags", &self.config.movflags);
        self.write_io.framer().begin_header();
        self.output.write_header(options)?;
        self.write_io.framer().finish_header();

        // measurement starts when media starts flowing
        self.buffer.clear();
        self.buffer.clear_write_counts();
        let framer = self.write_io.framer();
        framer.reset_counts();
        self.buffer.record_failures(framer.take_failures());
        self.clock.restart(Instant::now());
        self.shared.telemetry.store(HealthStats::default());

        self.set_state(PipelineState::Muxing);
        log::info!("[{}] header written, muxing", self.config.name);
        Ok(())
    }

    fn mux_next(&mut self) -> Result<()> {
        let Some(input) = self.input.as_mut() else {
            return Err(MuxError::NoStreams);
        };
        let read = input.read_packet();
        if self.read_io.recover_after_drop() {
            log::debug!("[{}] input resynchronized after a drop", self.config.name);
        }
        let mut packet = read?;

        let Some(out_index) = self.output.output_index(packet.index()) else {
            return Ok(());
        };
        let time_base = self
            .output
            .stream_time_base(out_index)
            .unwrap_or(packet.time_base());
        let ts = self.clock.stamp(out_index, time_base, Instant::now());
        packet.restamp(ts, time_base);
        log::trace!(
            "[{}] stream {} packet {} bytes{} at {}",
            self.config.name,
            out_index,
            packet.size(),
            if packet.is_key() { " key" } else { "" },
            ts
        );

        let written = self.output.write_packet(out_index, &mut packet);

        let framer = self.write_io.framer();
        let failures = framer.take_failures() + u64::from(written.is_err());
        let delivered = framer.media_published();
        self.buffer.record_failures(failures);
        self.shared.telemetry.store(HealthStats::from_statistics(
            &self.buffer.statistics(),
            delivered,
        ));
        written
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
