use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Counters kept by the frame buffer for one measurement epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStatistics {
    /// Every chunk handed to the buffer, stored or not.
    pub attempts: u64,
    /// Chunks appended without an overflow reset.
    pub writes: u64,
    /// Chunks lost to drops plus fragments the publish path refused.
    pub fails: u64,
    /// Instantaneous write rate, overwritten on every write.
    pub fps: f32,
    pub last_write: Option<Instant>,
}

impl FrameStatistics {
    pub(crate) fn record_write(&mut self, now: Instant) {
        if let Some(last) = self.last_write {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                self.fps = 1.0 / elapsed;
            }
        }
        self.last_write = Some(now);
        self.writes += 1;
    }

    /// Time since the producer last stored a chunk.
    pub fn since_last_write(&self) -> Option<Duration> {
        self.last_write.map(|t| t.elapsed())
    }
}

/// Health telemetry published by a running pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HealthStats {
    pub fps: f32,
    pub dropped_frames: u64,
    pub latency_micros: u64,
}

impl HealthStats {
    /// `delivered` counts media fragments handed to the publish path this epoch.
    pub fn from_statistics(stats: &FrameStatistics, delivered: u64) -> Self {
        Self {
            fps: stats.fps,
            dropped_frames: stats.attempts.saturating_sub(delivered),
            latency_micros: stats
                .since_last_write()
                .map(|d| d.as_micros() as u64)
                .unwrap_or_default(),
        }
    }
}

/// Shared cell the worker writes and the reporting side polls.
#[derive(Debug, Default)]
pub(crate) struct Telemetry {
    health: RwLock<HealthStats>,
}

impl Telemetry {
    pub fn store(&self, health: HealthStats) {
        *self.health.write().unwrap_or_else(|e| e.into_inner()) = health;
    }

    pub fn load(&self) -> HealthStats {
        *self.health.read().unwrap_or_else(|e| e.into_inner())
    }
}
