//! Wiring of the packet reader and the track processors.
//!
//! ```text
//! PacketSource -> PacketReader -> audio queue -> audio decode loop -> slot -> device callback
//!                              \-> video queue -> video decode loop -> slot -> VideoRefresh
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::audio::AudioTrackProcessor;
use crate::config::PipelineConfig;
use crate::engine::PacketSource;
use crate::packet::{TrackId, TrackKind};
use crate::reader::{PacketReader, ReaderHandle, ReaderSummary};
use crate::status::{PipelineEvent, PipelineStatus};
use crate::sync::ClockSource;
use crate::video::VideoTrackProcessor;

const EVENT_POLL: Duration = Duration::from_millis(50);

/// A component that stopped with an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// `None` for the packet reader.
    pub track: Option<TrackKind>,
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.track {
            Some(kind) => write!(f, "{kind} track failed: {}", self.reason),
            None => write!(f, "packet reader failed: {}", self.reason),
        }
    }
}

/// How [`Pipeline::wait_until_finished_or_cancel`] returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Every track reached the end of its stream.
    Finished,
    /// Every track stopped and at least one component failed.
    Failed {
        failures: Vec<Failure>,
        /// Tracks that still played to the end.
        finished: Vec<TrackKind>,
    },
    Cancelled,
}

/// Track outcomes collected from the event stream, kept across waits.
#[derive(Debug, Default)]
struct Outcomes {
    finished: Vec<TrackKind>,
    closed: Vec<TrackKind>,
    failures: Vec<Failure>,
}

impl Outcomes {
    fn is_settled(&self, kind: TrackKind) -> bool {
        self.finished.contains(&kind)
            || self.closed.contains(&kind)
            || self.failures.iter().any(|f| f.track == Some(kind))
    }

    fn end(&self) -> PlaybackEnd {
        if !self.failures.is_empty() {
            PlaybackEnd::Failed {
                failures: self.failures.clone(),
                finished: self.finished.clone(),
            }
        } else if !self.closed.is_empty() {
            PlaybackEnd::Cancelled
        } else {
            PlaybackEnd::Finished
        }
    }
}

/// Result of [`Pipeline::shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `None` when the pipeline had no track of that kind.
    pub audio_closed: Option<bool>,
    pub video_closed: Option<bool>,
    pub reader_joined: bool,
    pub reader: Option<ReaderSummary>,
}

impl ShutdownReport {
    /// `true` when every component confirmed it stopped.
    pub fn is_clean(&self) -> bool {
        self.audio_closed != Some(false) && self.video_closed != Some(false) && self.reader_joined
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    audio: Option<(TrackId, Arc<AudioTrackProcessor>)>,
    video: Option<(TrackId, Arc<VideoTrackProcessor>)>,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    reader: Option<ReaderHandle>,
    reader_finished: bool,
    outcomes: Outcomes,
    started: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config: config.sanitized(),
            audio: None,
            video: None,
            events_tx,
            events_rx,
            reader: None,
            reader_finished: false,
            outcomes: Outcomes::default(),
            started: false,
        }
    }

    pub fn with_audio(mut self, track: TrackId, processor: Arc<AudioTrackProcessor>) -> Self {
        self.audio = Some((track, processor));
        self
    }

    pub fn with_video(mut self, track: TrackId, processor: Arc<VideoTrackProcessor>) -> Self {
        self.video = Some((track, processor));
        self
    }

    pub fn audio(&self) -> Option<&Arc<AudioTrackProcessor>> {
        self.audio.as_ref().map(|(_, p)| p)
    }

    pub fn video(&self) -> Option<&Arc<VideoTrackProcessor>> {
        self.video.as_ref().map(|(_, p)| p)
    }

    /// Master clock for the video refresh loop (the audio track, when present).
    pub fn master_clock(&self) -> Option<&dyn ClockSource> {
        self.audio().map(|a| &***a as &dyn ClockSource)
    }

    /// Lifecycle notifications from the decode loops and the reader.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events_rx
    }

    /// Start every decode loop, then the reader feeding them from `source`.
    pub fn start(&mut self, source: Box<dyn PacketSource>) -> Result<()> {
        if self.started {
            bail!("pipeline already started");
        }
        if self.audio.is_none() && self.video.is_none() {
            bail!("pipeline has no tracks");
        }
        self.started = true;

        let mut reader = PacketReader::new(source, self.config.reader_poll_interval);
        if let Some((id, audio)) = &self.audio {
            audio.set_event_sink(self.events_tx.clone());
            audio.start().context("start audio track")?;
            reader = reader.route(*id, audio.clone());
        }
        if let Some((id, video)) = &self.video {
            video.set_event_sink(self.events_tx.clone());
            video.start().context("start video track")?;
            reader = reader.route(*id, video.clone());
        }

        self.reader = Some(reader.spawn(Some(self.events_tx.clone()))?);
        tracing::info!(
            audio = self.audio.is_some(),
            video = self.video.is_some(),
            watermark = self.config.packet_high_watermark,
            "pipeline started"
        );
        Ok(())
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            audio: self.audio().map(|a| a.status()),
            video: self.video().map(|v| v.status()),
            reader_finished: self.reader_finished
                || self.reader.as_ref().is_some_and(ReaderHandle::is_finished),
        }
    }

    fn pending_tracks(&self) -> Vec<TrackKind> {
        [
            self.audio.as_ref().map(|_| TrackKind::Audio),
            self.video.as_ref().map(|_| TrackKind::Video),
        ]
        .into_iter()
        .flatten()
        .filter(|kind| !self.outcomes.is_settled(*kind))
        .collect()
    }

    fn record(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::TrackFinished(kind) => self.outcomes.finished.push(kind),
            PipelineEvent::TrackFailed { kind, reason } => {
                let failure = Failure {
                    track: Some(kind),
                    reason,
                };
                self.outcomes.failures.push(failure.clone());
                tracing::warn!(remaining = ?self.pending_tracks(), "{failure}");
            }
            PipelineEvent::TrackClosed(kind) => {
                tracing::debug!(track = %kind, "track closed before finishing");
                self.outcomes.closed.push(kind);
            }
            PipelineEvent::ReaderFinished => self.reader_finished = true,
            PipelineEvent::ReaderFailed(reason) => {
                self.reader_finished = true;
                let failure = Failure { track: None, reason };
                tracing::warn!("{failure}; tracks drain what they already queued");
                self.outcomes.failures.push(failure);
            }
        }
    }

    /// Block until every track stopped (and the reader with them) or `cancel` is raised.
    ///
    /// A failing track does not end the wait while another track still plays. Outcomes
    /// are remembered, so waiting again returns the same result once everything stopped.
    pub fn wait_until_finished_or_cancel(&mut self, cancel: &AtomicBool) -> PlaybackEnd {
        loop {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("playback cancelled");
                return PlaybackEnd::Cancelled;
            }
            if self.pending_tracks().is_empty() && (self.reader_finished || self.reader.is_none()) {
                let end = self.outcomes.end();
                tracing::info!(?end, "all tracks stopped");
                return end;
            }
            match self.events_rx.recv_timeout(EVENT_POLL) {
                Ok(event) => self.record(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return PlaybackEnd::Cancelled,
            }
        }
    }

    /// Stop the reader, close every track, and report what confirmed shutdown.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if let Some(reader) = &self.reader {
            reader.stop();
        }
        report.audio_closed = self.audio().map(|a| a.close());
        report.video_closed = self.video().map(|v| v.close());

        match self.reader.take() {
            Some(reader) => match reader.join() {
                Ok(summary) => {
                    report.reader_joined = true;
                    report.reader = Some(summary);
                }
                Err(e) => {
                    // The thread exited; the error was already published as an event.
                    report.reader_joined = true;
                    tracing::debug!("reader ended with error: {e:#}");
                }
            },
            None => report.reader_joined = true,
        }
        self.reader_finished = true;

        if report.is_clean() {
            tracing::info!("pipeline shut down");
        } else {
            tracing::warn!(?report, "pipeline shut down with stuck components");
        }
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.stop();
        }
    }
}
