use std::fmt;

use ffmpeg_next::{Rational, codec, format::stream::Stream, media};

/// What the output side needs to mirror one demuxed stream.
#[derive(Clone)]
pub struct AvStream {
    index: usize,
    parameters: codec::Parameters,
    codec_id: codec::Id,
    medium: media::Type,
    width: u32,
    height: u32,
    time_base: Rational,
    frame_rate: Rational,
}

// Parameters owns its AVCodecParameters copy; nothing else points into it.
unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

impl AvStream {
    fn new(
        index: usize,
        parameters: codec::Parameters,
        time_base: Rational,
        frame_rate: Rational,
    ) -> Self {
        let (width, height) = unsafe {
            let raw = &*parameters.as_ptr();
            (raw.width.max(0) as u32, raw.height.max(0) as u32)
        };
        Self {
            index,
            codec_id: parameters.id(),
            medium: parameters.medium(),
            width,
            height,
            parameters,
            time_base,
            frame_rate,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &codec::Parameters {
        &self.parameters
    }

    pub fn codec_id(&self) -> codec::Id {
        self.codec_id
    }

    pub fn is_video(&self) -> bool {
        self.medium == media::Type::Video
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }
}

impl From<Stream<'_>> for AvStream {
    fn from(stream: Stream<'_>) -> Self {
        Self::new(
            stream.index(),
            stream.parameters(),
            stream.time_base(),
            stream.avg_frame_rate(),
        )
    }
}

impl fmt::Debug for AvStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvStream")
            .field("index", &self.index)
            .field("codec", &self.codec_id)
            .field("medium", &self.medium)
            .field("dimensions", &self.dimensions())
            .field("time_base", &self.time_base)
            .field("frame_rate", &self.frame_rate)
            .finish()
    }
}

impl fmt::Display for AvStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}", self.index, self.codec_id)?;
        if self.is_video() {
            write!(f, " {}x{}", self.width, self.height)?;
        }
        write!(f, " tb {}", self.time_base)?;
        // zero when the demuxer could not tell
        if self.frame_rate.numerator() > 0 {
            write!(f, " {} fps", self.frame_rate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_parameters() {
        let stream = AvStream::new(
            2,
            codec::Parameters::new(),
            Rational::new(1, 90_000),
            Rational::new(0, 1),
        );
        assert_eq!(stream.index(), 2);
        assert_eq!(stream.codec_id(), codec::Id::None);
        assert!(!stream.is_video());
        assert_eq!(stream.dimensions(), (0, 0));
        assert_eq!(stream.to_string(), "#2 None tb 1/90000");
    }

    #[test]
    fn test_display_includes_known_frame_rate() {
        let stream = AvStream::new(
            0,
            codec::Parameters::new(),
            Rational::new(1, 1200),
            Rational::new(30, 1),
        );
        assert_eq!(stream.to_string(), "#0 None tb 1/1200 30/1 fps");
    }
}
