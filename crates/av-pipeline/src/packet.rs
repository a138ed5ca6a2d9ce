//! Compressed packets and the timing units attached to them.

use std::fmt;

/// Identifier of a track inside the demuxed source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical kind of a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One compressed unit of input belonging to exactly one track.
///
/// Packets are moved from stage to stage and never shared; dropping one releases its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    pub track: TrackId,
    /// Presentation timestamp in the track's time base, when the container provides one.
    pub pts: Option<i64>,
    /// Duration in the track's time base (0 when unknown).
    pub duration: u64,
    pub data: Box<[u8]>,
}

impl Packet {
    pub fn new(track: TrackId, pts: Option<i64>, data: impl Into<Box<[u8]>>) -> Self {
        Self {
            track,
            pts,
            duration: 0,
            data: data.into(),
        }
    }
}

/// What travels through a track's packet queue.
///
/// `EndMarker` is distinct from "queue empty": it means no further packets will ever arrive.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem {
    Packet(Packet),
    EndMarker,
}

impl QueueItem {
    pub fn is_end_marker(&self) -> bool {
        matches!(self, QueueItem::EndMarker)
    }
}

/// Rational tick duration of a stream (`numer / denom` seconds per tick).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub numer: u32,
    pub denom: u32,
}

impl TimeBase {
    pub const MILLIS: TimeBase = TimeBase { numer: 1, denom: 1000 };

    pub fn new(numer: u32, denom: u32) -> Self {
        Self { numer, denom }
    }

    /// Convert `ticks` to milliseconds from stream start.
    ///
    /// Returns `None` for a degenerate time base or a timestamp before the stream start.
    pub fn to_millis(&self, ticks: i64) -> Option<u64> {
        if self.denom == 0 || ticks < 0 {
            return None;
        }
        let ms = (ticks as i128) * (self.numer as i128) * 1000 / (self.denom as i128);
        u64::try_from(ms).ok()
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MILLIS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_millis_converts_common_time_bases() {
        assert_eq!(TimeBase::new(1, 90_000).to_millis(90_000), Some(1000));
        assert_eq!(TimeBase::new(1, 44_100).to_millis(22_050), Some(500));
        assert_eq!(TimeBase::new(1001, 30_000).to_millis(30), Some(1001));
        assert_eq!(TimeBase::MILLIS.to_millis(42), Some(42));
    }

    #[test]
    fn to_millis_rejects_negative_and_degenerate() {
        assert_eq!(TimeBase::new(1, 1000).to_millis(-5), None);
        assert_eq!(TimeBase::new(1, 0).to_millis(10), None);
    }

    #[test]
    fn end_marker_is_distinct_from_packets() {
        let p = QueueItem::Packet(Packet::new(TrackId(1), Some(0), vec![0u8; 4]));
        assert!(!p.is_end_marker());
        assert!(QueueItem::EndMarker.is_end_marker());
    }
}
