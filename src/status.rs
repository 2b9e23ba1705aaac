use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::ipc::{IpcPublisher, Message};

static STATUS: LazyLock<StatusEmitter> = LazyLock::new(|| StatusEmitter::new(64));

/// Daemon-wide events, published by name with a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusEvent {
    Status {
        status: String,
    },
    Error {
        error: String,
    },
    ChannelRegistration {
        #[serde(rename = "chNum")]
        ch_num: u32,
        endpoint: String,
        status: bool,
    },
}

impl StatusEvent {
    pub fn status(status: impl Into<String>) -> Self {
        StatusEvent::Status {
            status: status.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        StatusEvent::Error {
            error: error.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Status { .. } => "status",
            StatusEvent::Error { .. } => "error",
            StatusEvent::ChannelRegistration { .. } => "channel_registration",
        }
    }

    fn to_message(&self) -> serde_json::Result<Message> {
        let body = serde_json::to_vec(self)?;
        Ok((Bytes::from_static(self.name().as_bytes()), Bytes::from(body)))
    }
}

pub fn status_path(dir: &Path) -> PathBuf {
    dir.join("geomux_status.ipc")
}

pub struct StatusEmitter {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Events nobody is listening for are dropped.
    pub fn emit(&self, event: StatusEvent) {
        log::debug!(
            "status {} to {} subscribers: {:?}",
            event.name(),
            self.tx.receiver_count(),
            event
        );
        let _ = self.tx.send(event);
    }

    /// Events emitted from now on, encoded as name and JSON body.
    pub fn messages(&self) -> BoxStream<'static, Message> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => match event.to_message() {
                    Ok(message) => Some(message),
                    Err(e) => {
                        log::error!("encoding {} event: {}", event.name(), e);
                        None
                    }
                },
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    log::warn!("status subscriber lagged, skipped {} events", n);
                    None
                }
            }
        })
        .boxed()
    }
}

pub fn emitter() -> &'static StatusEmitter {
    &STATUS
}

pub fn emit(event: StatusEvent) {
    emitter().emit(event);
}

/// Serves the daemon-wide events on `{dir}/geomux_status.ipc`.
pub async fn publish(dir: &Path) -> anyhow::Result<IpcPublisher> {
    IpcPublisher::bind_with(&status_path(dir), || emitter().messages()).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use tokio::net::UnixStream;
    use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

    use super::*;

    #[test]
    fn test_event_names_and_bodies() -> anyhow::Result<()> {
        let registration = StatusEvent::ChannelRegistration {
            ch_num: 2,
            endpoint: "/tmp/geomux_video0_2.ipc".to_string(),
            status: true,
        };
        assert_eq!(registration.name(), "channel_registration");
        assert_eq!(
            serde_json::to_value(&registration)?,
            serde_json::json!({"chNum": 2, "endpoint": "/tmp/geomux_video0_2.ipc", "status": true})
        );

        let error = StatusEvent::error("pipeline failed");
        assert_eq!(error.name(), "error");
        assert_eq!(
            serde_json::to_value(&error)?,
            serde_json::json!({"error": "pipeline failed"})
        );

        let status = StatusEvent::status("running");
        assert_eq!(status.name(), "status");
        assert_eq!(
            serde_json::to_value(&status)?,
            serde_json::json!({"status": "running"})
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_subscriber_reads_name_then_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = status_path(dir.path());
        let events = Arc::new(StatusEmitter::new(8));
        let source = events.clone();
        let publisher = IpcPublisher::bind_with(&path, move || source.messages()).await?;

        let stream = UnixStream::connect(&path).await?;
        let mut framed = FramedRead::new(stream, LengthDelimitedCodec::new());

        // the subscription is opened on accept
        let mut waited = 0;
        while events.tx.receiver_count() == 0 {
            anyhow::ensure!(waited < 100, "subscriber never attached");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }

        events.emit(StatusEvent::ChannelRegistration {
            ch_num: 3,
            endpoint: "/tmp/geomux_video1_3.ipc".to_string(),
            status: false,
        });

        let name = framed.next().await.context("closed before name")??;
        let body = framed.next().await.context("closed before body")??;
        assert_eq!(&name[..], b"channel_registration");
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["chNum"], 3);
        assert_eq!(value["endpoint"], "/tmp/geomux_video1_3.ipc");
        assert_eq!(value["status"], false);

        publisher.stop().await;
        assert!(!path.exists());
        Ok(())
    }
}
