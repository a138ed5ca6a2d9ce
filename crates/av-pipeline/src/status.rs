use std::fmt;

use crate::packet::TrackKind;

/// Lifecycle of a track processor as seen by its owner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TrackState {
    /// Created, decode loop not launched yet.
    #[default]
    Idle,
    Running,
    /// Decoder flushed after the end marker; terminal.
    Finished,
    /// Decoder reported an unrecoverable error; terminal for this track only.
    Failed(String),
    /// Decode loop exited because shutdown was requested.
    Closed,
}

impl TrackState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrackState::Idle | TrackState::Running)
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackState::Idle => f.write_str("idle"),
            TrackState::Running => f.write_str("running"),
            TrackState::Finished => f.write_str("finished"),
            TrackState::Failed(reason) => write!(f, "failed: {reason}"),
            TrackState::Closed => f.write_str("closed"),
        }
    }
}

/// Notifications published by the decode loops and the packet reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    TrackFinished(TrackKind),
    TrackFailed { kind: TrackKind, reason: String },
    TrackClosed(TrackKind),
    ReaderFinished,
    ReaderFailed(String),
}

/// Point-in-time view of one track processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackStatus {
    pub kind: TrackKind,
    pub state: TrackState,
    /// Presentation timestamp of the last consumed frame, in milliseconds.
    pub clock_ms: u64,
    pub queued_packets: usize,
    pub frames_produced: u64,
    /// Times a consumer found no ready frame.
    pub starved_events: u64,
}

/// Point-in-time view of the whole pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatus {
    pub audio: Option<TrackStatus>,
    pub video: Option<TrackStatus>,
    pub reader_finished: bool,
}

impl PipelineStatus {
    /// Signed video-minus-audio clock difference, when both tracks exist.
    pub fn drift_ms(&self) -> Option<i64> {
        match (&self.audio, &self.video) {
            (Some(a), Some(v)) => Some(v.clock_ms as i64 - a.clock_ms as i64),
            _ => None,
        }
    }

    /// `true` once every present track has reached a terminal state.
    pub fn all_tracks_terminal(&self) -> bool {
        [&self.audio, &self.video]
            .into_iter()
            .flatten()
            .all(|t| t.state.is_terminal())
    }
}
