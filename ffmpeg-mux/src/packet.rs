use std::collections::HashMap;
use std::time::Instant;

use ffmpeg_next::{
    Rational,
    codec::packet::Packet,
    util::mathematics::{Rescale, rescale::TIME_BASE},
};

/// Demuxed packet together with the time base of the stream it came from.
pub struct RawPacket {
    packet: Packet,
    time_base: Rational,
}

impl RawPacket {
    pub fn size(&self) -> usize {
        self.packet.size()
    }

    pub fn index(&self) -> usize {
        self.packet.stream()
    }

    pub fn is_key(&self) -> bool {
        self.packet.is_key()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Moves the packet to `time_base`: pts and dts both become `ts`, for
    /// streams without reordering, and the duration is rescaled.
    pub fn restamp(&mut self, ts: i64, time_base: Rational) {
        let duration = self.packet.duration();
        if duration > 0 {
            self.packet.set_duration(duration.rescale(self.time_base, time_base));
        }
        self.packet.set_pts(Some(ts));
        self.packet.set_dts(Some(ts));
        self.time_base = time_base;
    }

    pub fn get_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }
}

impl From<(Packet, Rational)> for RawPacket {
    fn from((packet, time_base): (Packet, Rational)) -> Self {
        Self { packet, time_base }
    }
}

/// Stamps packets with time elapsed since the session started.
///
/// The camera's own timestamps are ignored. Values are per output stream and
/// strictly increasing, even when two packets land in the same tick.
pub struct WallClock {
    start: Instant,
    last: HashMap<usize, i64>,
}

impl WallClock {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            last: HashMap::new(),
        }
    }

    pub fn restart(&mut self, start: Instant) {
        self.start = start;
        self.last.clear();
    }

    pub fn stamp(&mut self, stream: usize, time_base: Rational, now: Instant) -> i64 {
        let micros = now.saturating_duration_since(self.start).as_micros() as i64;
        let mut ts = micros.rescale(TIME_BASE, time_base);
        if let Some(&last) = self.last.get(&stream) {
            if ts <= last {
                ts = last + 1;
            }
        }
        self.last.insert(stream, ts);
        ts
    }
}
