use std::time::Duration;

/// Tuning parameters shared by the reader, the track processors and the sync loop.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Packets a track may hold before `needs_packet()` turns false.
    pub packet_high_watermark: usize,
    /// Reader sleep when no track wants more input.
    pub reader_poll_interval: Duration,
    /// Number of wake/check rounds `close()` performs before giving up.
    pub close_attempts: u32,
    /// Delay between two `close()` rounds.
    pub close_retry_interval: Duration,
    /// Audio/video drift tolerated before the sync loop corrects, in milliseconds.
    pub drift_threshold_ms: u64,
    /// Video cadence used when the stream does not report a frame rate.
    pub fallback_refresh_interval: Duration,
    /// Minimum spacing between repeated starvation / size-mismatch warnings.
    pub warn_interval: Duration,
}

impl Default for PipelineConfig {
    /// Defaults tuned for a local file feeding one audio and one video track.
    fn default() -> Self {
        Self {
            packet_high_watermark: 10,
            reader_poll_interval: Duration::from_millis(15),
            close_attempts: 5,
            close_retry_interval: Duration::from_millis(20),
            drift_threshold_ms: 30,
            fallback_refresh_interval: Duration::from_millis(30),
            warn_interval: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Replace unusable values (zero watermark, zero close budget) with the defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.packet_high_watermark == 0 {
            self.packet_high_watermark = defaults.packet_high_watermark;
        }
        if self.close_attempts == 0 {
            self.close_attempts = defaults.close_attempts;
        }
        if self.reader_poll_interval.is_zero() {
            self.reader_poll_interval = defaults.reader_poll_interval;
        }
        if self.fallback_refresh_interval.is_zero() {
            self.fallback_refresh_interval = defaults.fallback_refresh_interval;
        }
        self
    }

    /// Nominal display interval for `frame_rate`, or the fallback when unknown.
    pub fn refresh_interval(&self, frame_rate: Option<f64>) -> Duration {
        match frame_rate {
            Some(fps) if fps.is_finite() && fps > 0.0 => Duration::try_from_secs_f64(1.0 / fps)
                .unwrap_or(self.fallback_refresh_interval),
            _ => self.fallback_refresh_interval,
        }
    }
}
