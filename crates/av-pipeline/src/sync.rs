//! Audio/video drift correction.
//!
//! The audio device consumes at its own hardware pace, so the audio clock is the master.
//! Every display tick the [`SyncController`] compares both clocks and picks one of:
//! - video ahead by more than the threshold: skip the tick (hold the current picture)
//! - video behind by more than the threshold: present and halve the wait (catch-up)
//! - otherwise: present at the nominal `1 / frame_rate` cadence
//!
//! [`VideoRefresh`] runs that decision loop against a [`DisplaySurface`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::PipelineConfig;
use crate::status::TrackState;
use crate::track::TrackProcessor;
use crate::video::{PixelBuffer, VideoTrackProcessor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    /// Video is ahead: do not consume a frame this tick.
    Skip,
    /// Video is behind: consume and shorten the next wait.
    CatchUp,
    Nominal,
}

/// Drift policy for the video refresh cadence.
#[derive(Clone, Copy, Debug)]
pub struct SyncController {
    drift_threshold_ms: u64,
    nominal_interval: Duration,
}

impl SyncController {
    pub fn new(drift_threshold_ms: u64, nominal_interval: Duration) -> Self {
        Self {
            drift_threshold_ms,
            nominal_interval,
        }
    }

    pub fn from_config(config: &PipelineConfig, frame_rate: Option<f64>) -> Self {
        Self::new(config.drift_threshold_ms, config.refresh_interval(frame_rate))
    }

    pub fn drift_threshold_ms(&self) -> u64 {
        self.drift_threshold_ms
    }

    pub fn nominal_interval(&self) -> Duration {
        self.nominal_interval
    }

    pub fn decide(&self, video_clock_ms: u64, audio_clock_ms: u64) -> SyncDecision {
        if video_clock_ms.saturating_sub(audio_clock_ms) > self.drift_threshold_ms {
            SyncDecision::Skip
        } else if audio_clock_ms.saturating_sub(video_clock_ms) > self.drift_threshold_ms {
            SyncDecision::CatchUp
        } else {
            SyncDecision::Nominal
        }
    }

    /// Wait before the next tick after `decision`.
    pub fn interval(&self, decision: SyncDecision) -> Duration {
        match decision {
            SyncDecision::CatchUp => self.nominal_interval / 2,
            SyncDecision::Skip | SyncDecision::Nominal => self.nominal_interval,
        }
    }
}

/// Render target driven by the refresh loop.
pub trait DisplaySurface {
    fn present(&mut self, picture: &PixelBuffer) -> Result<()>;
}

/// A clock the video can be slaved to.
pub trait ClockSource: Send + Sync {
    fn clock_ms(&self) -> u64;

    /// `false` once the clock can no longer advance (track finished, failed or closed).
    fn is_advancing(&self) -> bool;
}

impl<T: Send + 'static> ClockSource for TrackProcessor<T> {
    fn clock_ms(&self) -> u64 {
        TrackProcessor::clock_ms(self)
    }

    fn is_advancing(&self) -> bool {
        matches!(self.state(), TrackState::Idle | TrackState::Running)
    }
}

/// Counters for one refresh run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub presented: u64,
    pub skipped: u64,
    pub catch_up: u64,
    /// Ticks that wanted a picture but none was ready.
    pub missed: u64,
}

/// Display tick loop pacing a video track against an optional master clock.
pub struct VideoRefresh<'a> {
    controller: SyncController,
    video: &'a VideoTrackProcessor,
    master: Option<&'a dyn ClockSource>,
}

impl<'a> VideoRefresh<'a> {
    pub fn new(
        controller: SyncController,
        video: &'a VideoTrackProcessor,
        master: Option<&'a dyn ClockSource>,
    ) -> Self {
        Self {
            controller,
            video,
            master,
        }
    }

    /// Decision for the current clocks. Without a live master clock the cadence is nominal.
    pub fn tick_decision(&self) -> SyncDecision {
        match self.master {
            Some(master) if master.is_advancing() => self
                .controller
                .decide(self.video.clock_ms(), master.clock_ms()),
            _ => SyncDecision::Nominal,
        }
    }

    /// Run one tick: decide, present if allowed, and return the wait before the next tick.
    pub fn tick(&self, surface: &mut dyn DisplaySurface, stats: &mut RefreshStats) -> Result<Duration> {
        let decision = self.tick_decision();
        match decision {
            SyncDecision::Skip => {
                stats.skipped += 1;
                tracing::trace!(
                    video_ms = self.video.clock_ms(),
                    "video ahead of audio; holding picture"
                );
            }
            SyncDecision::CatchUp | SyncDecision::Nominal => {
                if decision == SyncDecision::CatchUp {
                    stats.catch_up += 1;
                }
                let presented = match self.video.peek_frame() {
                    Some(picture) => {
                        surface.present(&picture).context("present video frame")?;
                        true
                    }
                    None => false,
                };
                if presented {
                    self.video.consume_frame();
                    stats.presented += 1;
                } else {
                    self.video.note_missed_refresh();
                    stats.missed += 1;
                }
            }
        }
        Ok(self.controller.interval(decision))
    }

    /// Tick until the video track stops producing or `stop` is raised.
    pub fn run(&self, surface: &mut dyn DisplaySurface, stop: &AtomicBool) -> Result<RefreshStats> {
        let mut stats = RefreshStats::default();
        tracing::info!(
            interval_ms = self.controller.nominal_interval().as_millis() as u64,
            drift_threshold_ms = self.controller.drift_threshold_ms(),
            "video refresh started"
        );
        while !stop.load(Ordering::Relaxed)
            && !self.video.is_stream_finished()
            && !self.video.is_failed()
            && !self.video.is_closed()
        {
            let wait = self.tick(surface, &mut stats)?;
            thread::sleep(wait);
        }
        tracing::info!(
            presented = stats.presented,
            skipped = stats.skipped,
            catch_up = stats.catch_up,
            missed = stats.missed,
            "video refresh finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::QueueItem;
    use crate::test_support::{ScriptedEngine, packet, wait_until};
    use crate::video::tests::video_processor;
    use std::sync::atomic::AtomicU64;

    struct FixedClock {
        ms: AtomicU64,
        advancing: bool,
    }

    impl ClockSource for FixedClock {
        fn clock_ms(&self) -> u64 {
            self.ms.load(Ordering::Relaxed)
        }

        fn is_advancing(&self) -> bool {
            self.advancing
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        shown: Vec<u8>,
    }

    impl DisplaySurface for RecordingSurface {
        fn present(&mut self, picture: &PixelBuffer) -> Result<()> {
            self.shown.push(picture.planes[0][0]);
            Ok(())
        }
    }

    fn controller() -> SyncController {
        SyncController::new(30, Duration::from_millis(40))
    }

    #[test]
    fn video_ahead_skips_tick() {
        assert_eq!(controller().decide(1000, 950), SyncDecision::Skip);
    }

    #[test]
    fn video_behind_catches_up_with_half_interval() {
        let c = controller();
        let d = c.decide(900, 950);
        assert_eq!(d, SyncDecision::CatchUp);
        assert_eq!(c.interval(d), Duration::from_millis(20));
    }

    #[test]
    fn small_drift_keeps_nominal_cadence() {
        let c = controller();
        assert_eq!(c.decide(1000, 980), SyncDecision::Nominal);
        assert_eq!(c.decide(980, 1000), SyncDecision::Nominal);
        assert_eq!(c.decide(1030, 1000), SyncDecision::Nominal);
        assert_eq!(c.interval(SyncDecision::Nominal), Duration::from_millis(40));
        assert_eq!(c.interval(SyncDecision::Skip), Duration::from_millis(40));
    }

    #[test]
    fn from_config_uses_frame_rate_and_threshold() {
        let cfg = PipelineConfig::default();
        let c = SyncController::from_config(&cfg, Some(50.0));
        assert_eq!(c.nominal_interval(), Duration::from_millis(20));
        assert_eq!(c.drift_threshold_ms(), 30);
    }

    #[test]
    fn skip_tick_does_not_consume() {
        let video = video_processor(&PipelineConfig::default(), ScriptedEngine::default());
        video.start().unwrap();
        video.push_packet(QueueItem::Packet(packet(0, 100)));
        assert!(wait_until(Duration::from_secs(2), || video.is_frame_ready()));
        assert!(video.consume_frame());
        video.push_packet(QueueItem::Packet(packet(0, 140)));
        assert!(wait_until(Duration::from_secs(2), || video.is_frame_ready()));

        let audio = FixedClock {
            ms: AtomicU64::new(20),
            advancing: true,
        };
        let refresh = VideoRefresh::new(controller(), &video, Some(&audio));
        let mut surface = RecordingSurface::default();
        let mut stats = RefreshStats::default();

        let wait = refresh.tick(&mut surface, &mut stats).unwrap();
        assert_eq!(wait, Duration::from_millis(40));
        assert_eq!(stats.skipped, 1);
        assert!(surface.shown.is_empty());
        assert!(video.is_frame_ready());

        audio.ms.store(100, Ordering::Relaxed);
        refresh.tick(&mut surface, &mut stats).unwrap();
        assert_eq!(surface.shown, vec![140]);
        assert_eq!(video.clock_ms(), 140);
        assert!(video.close());
    }

    #[test]
    fn stalled_master_clock_falls_back_to_nominal() {
        let video = video_processor(&PipelineConfig::default(), ScriptedEngine::default());
        let audio = FixedClock {
            ms: AtomicU64::new(0),
            advancing: false,
        };
        let refresh = VideoRefresh::new(controller(), &video, Some(&audio));
        assert_eq!(refresh.tick_decision(), SyncDecision::Nominal);
    }

    #[test]
    fn run_presents_every_frame_until_finished() {
        let cfg = PipelineConfig {
            fallback_refresh_interval: Duration::from_millis(1),
            ..PipelineConfig::default()
        };
        let video = crate::video::VideoTrackProcessor::new(
            crate::packet::TimeBase::MILLIS,
            None,
            &cfg,
            ScriptedEngine::default(),
            crate::video::tests::StampConverter,
        );
        video.start().unwrap();
        for n in 1..=5 {
            video.push_packet(QueueItem::Packet(packet(0, n * 10)));
        }
        video.push_packet(QueueItem::EndMarker);

        let controller = SyncController::from_config(&cfg, video.frame_rate());
        let refresh = VideoRefresh::new(controller, &video, None);
        let mut surface = RecordingSurface::default();
        let stop = AtomicBool::new(false);
        let stats = refresh.run(&mut surface, &stop).unwrap();

        assert_eq!(surface.shown, vec![10, 20, 30, 40, 50]);
        assert_eq!(stats.presented, 5);
        assert!(video.is_stream_finished());
        assert!(video.close());
    }

    #[test]
    fn run_returns_immediately_when_stopped() {
        let video = video_processor(&PipelineConfig::default(), ScriptedEngine::default());
        let refresh = VideoRefresh::new(controller(), &video, None);
        let stop = AtomicBool::new(true);
        let stats = refresh.run(&mut RecordingSurface::default(), &stop).unwrap();
        assert_eq!(stats, RefreshStats::default());
    }
}
