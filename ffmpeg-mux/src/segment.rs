use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::sink::PublishSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Initialization segment (ftyp + moov).
    Init,
    /// Self-contained fragment (moof + mdat).
    Media,
}

impl SegmentKind {
    /// Wire tag sent as the first message part.
    pub const fn tag(self) -> &'static [u8] {
        match self {
            SegmentKind::Init => b"i",
            SegmentKind::Media => b"m",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"i" => Some(SegmentKind::Init),
            b"m" => Some(SegmentKind::Media),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub payload: Bytes,
}

impl Segment {
    pub fn init(payload: Bytes) -> Self {
        Self {
            kind: SegmentKind::Init,
            payload,
        }
    }

    pub fn media(payload: Bytes) -> Self {
        Self {
            kind: SegmentKind::Media,
            payload,
        }
    }

    pub fn tag(&self) -> &'static [u8] {
        self.kind.tag()
    }
}

enum Phase {
    AwaitingHeader,
    /// The muxer writes its header in two calls; both are merged into one
    /// init segment.
    HoldingHeader {
        composing: bool,
        pending: BytesMut,
    },
    Streaming,
}

/// Turns the muxer's output writes into tagged segments.
///
/// Lives behind the output I/O callback, so it only ever runs on the muxer
/// worker thread.
pub struct SegmentFramer {
    sink: Arc<dyn PublishSink>,
    phase: Phase,
    media_published: u64,
    failures: u64,
}

impl SegmentFramer {
    pub fn new(sink: Arc<dyn PublishSink>) -> Self {
        Self {
            sink,
            phase: Phase::AwaitingHeader,
            media_published: 0,
            failures: 0,
        }
    }

    /// Call right before the container header is written.
    pub fn begin_header(&mut self) {
        self.phase = Phase::HoldingHeader {
            composing: false,
            pending: BytesMut::new(),
        };
    }

    /// Handles one write from the muxer.
    pub fn push(&mut self, bytes: &[u8]) {
        match &mut self.phase {
            Phase::AwaitingHeader => {
                log::warn!("dropping {} bytes written before the header", bytes.len());
            }
            Phase::HoldingHeader { composing, pending } => {
                pending.extend_from_slice(bytes);
                if !*composing {
                    *composing = true;
                    return;
                }
                let payload = pending.split().freeze();
                self.phase = Phase::Streaming;
                self.emit(Segment::init(payload));
            }
            Phase::Streaming => {
                self.emit(Segment::media(Bytes::copy_from_slice(bytes)));
            }
        }
    }

    /// Call once the header write returned. Emits whatever header bytes are
    /// still held, so an init segment never absorbs media.
    pub fn finish_header(&mut self) {
        if let Phase::HoldingHeader { pending, .. } = &mut self.phase {
            let payload = pending.split().freeze();
            self.phase = Phase::Streaming;
            if payload.is_empty() {
                log::warn!("header write produced no output");
            } else {
                self.emit(Segment::init(payload));
            }
        }
    }

    /// Media segments accepted by the sink since the last reset.
    pub fn media_published(&self) -> u64 {
        self.media_published
    }

    /// Returns and clears the count of segments the sink refused.
    pub fn take_failures(&mut self) -> u64 {
        std::mem::take(&mut self.failures)
    }

    /// Starts a new delivery count. Failures not yet taken are kept so a
    /// refused init segment still reaches the frame statistics.
    pub fn reset_counts(&mut self) {
        self.media_published = 0;
    }

    fn emit(&mut self, segment: Segment) {
        let kind = segment.kind;
        let len = segment.payload.len();
        match self.sink.publish(segment) {
            Ok(()) => {
                log::trace!("published {:?} segment, {} bytes", kind, len);
                if kind == SegmentKind::Media {
                    self.media_published += 1;
                }
            }
            Err(e) => {
                self.failures += 1;
                log::warn!("failed to publish {:?} segment: {}", kind, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::sink::PublishError;

    #[derive(Default)]
    struct RecordingSink {
        segments: Mutex<Vec<Segment>>,
        refuse: AtomicBool,
    }

    impl RecordingSink {
        fn taken(&self) -> Vec<Segment> {
            self.segments.lock().unwrap().clone()
        }
    }

    impl PublishSink for RecordingSink {
        fn publish(&self, segment: Segment) -> Result<(), PublishError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(PublishError::Closed);
            }
            self.segments.lock().unwrap().push(segment);
            Ok(())
        }
    }

    #[test]
    fn test_header_writes_coalesce_into_one_init() {
        let sink = Arc::new(RecordingSink::default());
        let mut framer = SegmentFramer::new(sink.clone());

        framer.begin_header();
        framer.push(b"ftyp");
        assert!(sink.taken().is_empty());
        framer.push(b"moov");
        framer.finish_header();

        let fragments: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 3 + i as usize]).collect();
        for f in &fragments {
            framer.push(f);
        }

        let segments = sink.taken();
        assert_eq!(segments.len(), 6);
        assert_eq!(segments[0], Segment::init(Bytes::from_static(b"ftypmoov")));
        for (segment, fragment) in segments[1..].iter().zip(&fragments) {
            assert_eq!(segment.kind, SegmentKind::Media);
            assert_eq!(&segment.payload[..], &fragment[..]);
        }
        assert_eq!(framer.media_published(), 5);
    }

    #[test]
    fn test_single_header_write_is_flushed_on_finish() {
        let sink = Arc::new(RecordingSink::default());
        let mut framer = SegmentFramer::new(sink.clone());

        framer.begin_header();
        framer.push(b"ftypmoov");
        framer.finish_header();
        framer.push(b"moof");

        let segments = sink.taken();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].kind, SegmentKind::Init);
        assert_eq!(&segments[0].payload[..], b"ftypmoov");
        assert_eq!(segments[1].kind, SegmentKind::Media);
    }

    #[test]
    fn test_writes_before_header_are_not_media() {
        let sink = Arc::new(RecordingSink::default());
        let mut framer = SegmentFramer::new(sink.clone());

        framer.push(b"stray");
        assert!(sink.taken().is_empty());
        assert_eq!(framer.media_published(), 0);
    }

    #[test]
    fn test_publish_failure_is_counted_and_streaming_continues() {
        let sink = Arc::new(RecordingSink::default());
        let mut framer = SegmentFramer::new(sink.clone());
        framer.begin_header();
        framer.push(b"a");
        framer.push(b"b");

        sink.refuse.store(true, Ordering::SeqCst);
        framer.push(b"lost");
        sink.refuse.store(false, Ordering::SeqCst);
        framer.push(b"kept");

        assert_eq!(framer.take_failures(), 1);
        assert_eq!(framer.take_failures(), 0);
        assert_eq!(framer.media_published(), 1);
        let segments = sink.taken();
        assert_eq!(segments.len(), 2);
        assert_eq!(&segments[1].payload[..], b"kept");
    }

    #[test]
    fn test_refused_init_outlives_count_reset() {
        let sink = Arc::new(RecordingSink::default());
        let mut framer = SegmentFramer::new(sink.clone());
        sink.refuse.store(true, Ordering::SeqCst);
        framer.begin_header();
        framer.push(b"ftyp");
        framer.push(b"moov");
        framer.finish_header();
        sink.refuse.store(false, Ordering::SeqCst);

        framer.reset_counts();
        framer.push(b"moof");
        assert_eq!(framer.take_failures(), 1);
        assert_eq!(framer.media_published(), 1);
        assert!(sink.taken().iter().all(|s| s.kind == SegmentKind::Media));
    }

    #[test]
    fn test_tags_round_trip() {
        for kind in [SegmentKind::Init, SegmentKind::Media] {
            assert_eq!(SegmentKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SegmentKind::from_tag(b"geo"), None);
    }
}
