use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use ffmpeg_mux::{BroadcastSink, Muxer, MuxerConfig};
use serde::Serialize;

use crate::ipc::{self, IpcPublisher};
use crate::source::{ChunkHandler, HardwareSource};
use crate::status::{self, StatusEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub id: String,
    pub camera: u32,
    pub channel: u32,
    pub endpoint: String,
    pub state: String,
    pub fatal_error: Option<String>,
    pub fps: f32,
    pub dropped_frames: u64,
    pub latency_micros: u64,
    pub subscribers: usize,
    pub uptime_secs: u64,
}

pub fn channel_id(camera: u32, channel: u32) -> String {
    format!("video{}_{}", camera, channel)
}

fn registration(channel: u32, publisher: &IpcPublisher, online: bool) -> StatusEvent {
    StatusEvent::ChannelRegistration {
        ch_num: channel,
        endpoint: publisher.path().display().to_string(),
        status: online,
    }
}

/// Joins the worker off the async runtime.
async fn stop_muxer(channel: u32, mut muxer: Muxer) {
    if let Err(e) = tokio::task::spawn_blocking(move || muxer.stop()).await {
        log::error!("stopping muxer of channel {} failed: {}", channel, e);
    }
}

/// One camera channel: a source registration feeding a muxer whose segments
/// go out on a unix socket.
pub struct VideoChannel {
    camera: u32,
    channel: u32,
    muxer: Muxer,
    sink: Arc<BroadcastSink>,
    publisher: IpcPublisher,
    source: Arc<dyn HardwareSource>,
    started: Instant,
}

impl VideoChannel {
    pub async fn start(
        camera: u32,
        channel: u32,
        socket_dir: &Path,
        segment_backlog: usize,
        config: MuxerConfig,
        source: Arc<dyn HardwareSource>,
    ) -> anyhow::Result<Self> {
        let endpoint = ipc::endpoint_path(socket_dir, camera, channel);
        let sink = Arc::new(BroadcastSink::new(segment_backlog));
        let muxer = Muxer::new(config, sink.clone())
            .with_context(|| format!("creating muxer for channel {}", channel))?;
        let publisher = match IpcPublisher::bind(&endpoint, sink.clone()).await {
            Ok(publisher) => publisher,
            Err(e) => {
                stop_muxer(channel, muxer).await;
                return Err(e);
            }
        };

        let handler = ChunkHandler::new(channel, muxer.buffer().clone());
        if let Err(e) = source
            .register(channel, handler)
            .and_then(|_| source.start(channel))
        {
            source.unregister(channel);
            stop_muxer(channel, muxer).await;
            publisher.stop().await;
            return Err(e.context(format!("starting source channel {}", channel)));
        }

        log::info!(
            "channel {} of camera {} streaming to {}",
            channel,
            camera,
            publisher.path().display()
        );
        status::emit(registration(channel, &publisher, true));
        Ok(Self {
            camera,
            channel,
            muxer,
            sink,
            publisher,
            source,
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> String {
        channel_id(self.camera, self.channel)
    }

    /// False once the source stopped delivering or the pipeline failed.
    pub fn is_healthy(&self) -> bool {
        self.source.is_alive(self.channel)
            && self.muxer.is_alive()
            && self.muxer.fatal_error().is_none()
    }

    pub fn status(&self) -> ChannelStatus {
        let health = self.muxer.health();
        ChannelStatus {
            id: self.id(),
            camera: self.camera,
            channel: self.channel,
            endpoint: self.publisher.path().display().to_string(),
            state: self.muxer.state().to_string(),
            fatal_error: self.muxer.fatal_error(),
            fps: health.fps,
            dropped_frames: health.dropped_frames,
            latency_micros: health.latency_micros,
            subscribers: self.sink.receiver_count(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Stops delivery first, then the muxer, then the endpoint.
    pub async fn shutdown(self) {
        let id = self.id();
        let Self {
            channel,
            mut muxer,
            sink,
            publisher,
            source,
            ..
        } = self;

        let joined = tokio::task::spawn_blocking(move || {
            source.unregister(channel);
            muxer.stop();
        })
        .await;
        if let Err(e) = joined {
            log::error!("channel {} teardown failed: {}", id, e);
        }

        sink.close();
        status::emit(registration(channel, &publisher, false));
        publisher.stop().await;
        log::info!("channel {} shut down", id);
    }
}
