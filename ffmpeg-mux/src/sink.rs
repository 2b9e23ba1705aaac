use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::segment::{Segment, SegmentKind};

pub type SegmentSender = broadcast::Sender<Segment>;
pub type SegmentReceiver = broadcast::Receiver<Segment>;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish endpoint closed")]
    Closed,
    #[error("publish failed: {0}")]
    Transport(String),
}

/// Destination for tagged segments.
///
/// `publish` is called from the muxer worker thread and must not block for
/// long; a slow transport stalls the whole pipeline.
pub trait PublishSink: Send + Sync {
    fn publish(&self, segment: Segment) -> Result<(), PublishError>;
}

/// Fan-out sink backed by a tokio broadcast channel.
///
/// Publishing with nobody subscribed is not an error, segments are simply
/// dropped. The last init segment is cached so late subscribers can start
/// decoding without waiting for a new session.
pub struct BroadcastSink {
    tx: SegmentSender,
    init: Mutex<Option<Segment>>,
    closed: AtomicBool,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            init: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the cached init segment together with a receiver positioned
    /// right after it. Nothing published in between is lost or duplicated.
    pub fn subscribe(&self) -> (Option<Segment>, SegmentReceiver) {
        let init = self.lock_init();
        (init.clone(), self.tx.subscribe())
    }

    /// Subscription as a stream: cached init first, then live segments.
    /// Lagged receivers skip ahead with a warning.
    pub fn stream(&self) -> BoxStream<'static, Segment> {
        let (init, rx) = self.subscribe();
        let live = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(segment) => Some(segment),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    log::warn!("segment subscriber lagged, skipped {} segments", n);
                    None
                }
            }
        });
        futures::stream::iter(init).chain(live).boxed()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Refuses every later publish. Subscribers keep what they already have.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn lock_init(&self) -> MutexGuard<'_, Option<Segment>> {
        self.init.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PublishSink for BroadcastSink {
    fn publish(&self, segment: Segment) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        // held across the send so subscribe() sees either the cache or the message
        let mut init = self.lock_init();
        if segment.kind == SegmentKind::Init {
            *init = Some(segment.clone());
        }
        let _ = self.tx.send(segment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let sink = BroadcastSink::new(8);
        assert!(sink.publish(Segment::media(Bytes::from_static(b"x"))).is_ok());
        assert_eq!(sink.receiver_count(), 0);
    }

    #[test]
    fn test_closed_sink_refuses() {
        let sink = BroadcastSink::new(8);
        sink.close();
        let err = sink
            .publish(Segment::media(Bytes::from_static(b"x")))
            .unwrap_err();
        assert!(matches!(err, PublishError::Closed));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_cached_init() -> anyhow::Result<()> {
        let sink = BroadcastSink::new(8);
        sink.publish(Segment::init(Bytes::from_static(b"ftypmoov")))?;
        sink.publish(Segment::media(Bytes::from_static(b"old")))?;

        let (init, mut rx) = sink.subscribe();
        assert_eq!(init, Some(Segment::init(Bytes::from_static(b"ftypmoov"))));

        sink.publish(Segment::media(Bytes::from_static(b"new")))?;
        let next = rx.recv().await?;
        assert_eq!(next, Segment::media(Bytes::from_static(b"new")));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_starts_with_init() -> anyhow::Result<()> {
        let sink = BroadcastSink::new(8);
        sink.publish(Segment::init(Bytes::from_static(b"init")))?;

        let mut stream = Box::pin(sink.stream());
        sink.publish(Segment::media(Bytes::from_static(b"frag")))?;

        let first = stream.next().await;
        let second = stream.next().await;
        assert_eq!(first.map(|s| s.kind), Some(SegmentKind::Init));
        assert_eq!(second.map(|s| s.kind), Some(SegmentKind::Media));
        Ok(())
    }
}
