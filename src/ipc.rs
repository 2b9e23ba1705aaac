use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use ffmpeg_mux::BroadcastSink;
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// One published message: a short tag frame followed by a payload frame.
pub type Message = (Bytes, Bytes);

/// Socket path for one camera channel.
pub fn endpoint_path(dir: &Path, camera: u32, channel: u32) -> PathBuf {
    dir.join(format!("geomux_video{}_{}.ipc", camera, channel))
}

/// Segments of `sink` as messages, cached init first.
fn segment_messages(sink: &BroadcastSink) -> BoxStream<'static, Message> {
    sink.stream()
        .map(|segment| (Bytes::from_static(segment.tag()), segment.payload))
        .boxed()
}

/// Publishes messages on a unix socket.
///
/// Every message is two length-delimited frames: the tag, then the payload.
/// Each subscriber gets its own stream, opened when its connection is
/// accepted.
pub struct IpcPublisher {
    path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl IpcPublisher {
    /// Publishes a channel's segments. A subscriber first receives the
    /// current init segment, if any.
    pub async fn bind(path: &Path, sink: Arc<BroadcastSink>) -> anyhow::Result<Self> {
        Self::bind_with(path, move || segment_messages(&sink)).await
    }

    pub async fn bind_with<F, S>(path: &Path, subscribe: F) -> anyhow::Result<Self>
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Message> + Send + 'static,
    {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener =
            UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
        log::info!("publishing on {}", path.display());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, subscribe, cancel.clone()));
        Ok(Self {
            path: path.to_path_buf(),
            cancel,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("removing {}: {}", self.path.display(), e);
        }
    }
}

async fn accept_loop<F, S>(listener: UnixListener, subscribe: F, cancel: CancellationToken)
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Message> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let messages = subscribe();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_subscriber(stream, messages, cancel).await {
                            log::debug!("subscriber disconnected: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                }
            },
        }
    }
}

async fn serve_subscriber<S>(
    stream: UnixStream,
    messages: S,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    S: Stream<Item = Message> + Send + 'static,
{
    let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
    let mut messages = std::pin::pin!(messages);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => match next {
                Some((tag, payload)) => {
                    framed.feed(tag).await?;
                    framed.send(payload).await?;
                }
                None => break,
            },
        }
    }
    Ok(())
}
