use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free rate limiter for repeated warnings.
///
/// Safe to poll from the real-time audio callback: one atomic load, at most one store.
#[derive(Debug)]
pub(crate) struct WarnThrottle {
    origin: Instant,
    interval_ms: u64,
    /// Milliseconds since `origin` of the last allowed warning, plus one (0 = never).
    last_ms: AtomicU64,
}

impl WarnThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(0),
        }
    }

    /// Returns `true` if a warning may be emitted now.
    pub(crate) fn allow(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
