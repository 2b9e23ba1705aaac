use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::channel::{VideoChannel, channel_id};
use crate::config::Config;
use crate::source::{HardwareSource, ReplayConfig, ReplaySource};
use crate::status::StatusEvent;

mod api;
mod channel;
mod config;
mod handler;
mod ipc;
mod manager;
mod nal;
mod source;
mod status;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_mux", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

async fn start_channel(
    config: &Config,
    channel: u32,
    source: Arc<dyn HardwareSource>,
) -> anyhow::Result<()> {
    let id = channel_id(config.camera, channel);
    let video = VideoChannel::start(
        config.camera,
        channel,
        &config.socket_dir,
        config.segment_backlog,
        config.muxer_config(&id),
        source,
    )
    .await?;
    manager::add_channel(video).await;
    Ok(())
}

/// Rebuilds every configured channel that is missing or has stopped.
async fn supervise(config: &Config, source: &Arc<dyn HardwareSource>) {
    for (id, fatal) in manager::unhealthy_channels().await {
        match fatal {
            Some(error) => {
                log::error!("channel {} failed: {}, restarting", id, error);
                status::emit(StatusEvent::error(format!("channel {}: {}", id, error)));
            }
            None => log::warn!("channel {} is down, restarting", id),
        }
        manager::remove_channel(&id).await;
    }
    for &channel in &config.channels {
        let id = channel_id(config.camera, channel);
        if manager::contains_channel(&id).await {
            continue;
        }
        if let Err(e) = start_channel(config, channel, source.clone()).await {
            log::error!("channel {} failed to start: {:#}", id, e);
            status::emit(StatusEvent::error(format!("channel {}: {:#}", id, e)));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    ffmpeg_mux::init().context("initializing ffmpeg")?;
    let config = config::config();

    let replay = ReplaySource::open(ReplayConfig {
        path: config.replay_file.clone(),
        fps: config.fps,
        looped: !config.no_loop,
        buffer_count: config.source_buffers,
    })?;
    log::info!(
        "camera {} replaying {} on channels {:?}",
        config.camera,
        replay.path().display(),
        config.channels
    );
    let source: Arc<dyn HardwareSource> = Arc::new(replay);

    let cancel = CancellationToken::new();
    let api = api::start_api_server(config.listen, cancel.clone()).await?;
    let status_publisher = status::publish(&config.socket_dir).await?;

    supervise(config, &source).await;
    status::emit(StatusEvent::status("running"));
    let mut ticker = tokio::time::interval(Duration::from_secs(config.supervise_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                cancel.cancel();
            },
            _ = ticker.tick() => {
                supervise(config, &source).await;
            },
        }
    }

    status::emit(StatusEvent::status("stopping"));
    manager::shutdown_all().await;
    status_publisher.stop().await;
    if let Err(e) = api.await {
        log::error!("API server task failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use futures::StreamExt;

    use super::*;

    const CLIP: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0, 0x1e, //
        0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80, //
        0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, //
        0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x03,
    ];

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervise_rebuilds_finished_channel() -> anyhow::Result<()> {
        ffmpeg_mux::init()?;
        let dir = tempfile::tempdir()?;
        let socket_dir = dir.path().to_str().context("non-utf8 temp dir")?;
        let config = Config::try_parse_from([
            "geomux",
            "--replay-file",
            "clip.h264",
            "--camera",
            "7",
            "--channels",
            "3",
            "--socket-dir",
            socket_dir,
        ])?;
        let replay = ReplaySource::from_bytes(
            ReplayConfig {
                path: PathBuf::from("clip.h264"),
                fps: 10,
                looped: false,
                buffer_count: 4,
            },
            CLIP,
        )?;
        let source: Arc<dyn HardwareSource> = Arc::new(replay);
        let id = channel_id(7, 3);
        let endpoint = ipc::endpoint_path(dir.path(), 7, 3).display().to_string();
        let mut events = status::emitter().messages();

        supervise(&config, &source).await;
        assert!(manager::contains_channel(&id).await);

        // two pictures at 10 fps, then the replay ends
        let mut finished = false;
        for _ in 0..60 {
            let unhealthy = manager::unhealthy_channels().await;
            if unhealthy.iter().any(|(down, _)| down == &id) {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(finished, "replay never finished");

        supervise(&config, &source).await;
        assert!(manager::contains_channel(&id).await);

        let mut registrations = Vec::new();
        while registrations.len() < 3 {
            let (name, body) = tokio::time::timeout(Duration::from_secs(2), events.next())
                .await?
                .context("status stream ended")?;
            if &name[..] != b"channel_registration" {
                continue;
            }
            let value: serde_json::Value = serde_json::from_slice(&body)?;
            if value["endpoint"] == endpoint.as_str() {
                assert_eq!(value["chNum"], 3);
                registrations.push(value["status"].as_bool());
            }
        }
        assert_eq!(registrations, vec![Some(true), Some(false), Some(true)]);

        assert!(manager::remove_channel(&id).await);
        Ok(())
    }
}
