//! Wall-clock abstraction.
//!
//! Dedup windows, rate windows, time buckets and lease expiry all read the
//! time through [`Clock`] so tests can pin or advance it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock pinned at `start`.
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    /// Create a clock pinned at a fixed, bucket-aligned instant.
    pub fn fixed() -> Arc<Self> {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::new(start)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::milliseconds(by.as_millis() as i64);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared clock handle passed to every component.
pub type SharedClock = Arc<dyn Clock>;

/// Default clock for production wiring.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// Time elapsed from `earlier` to `now`, zero if the clock went backwards.
pub fn elapsed(now: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::fixed();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(elapsed(clock.now(), start), Duration::from_millis(1500));
    }

    #[test]
    fn elapsed_saturates_when_clock_goes_back() {
        let clock = ManualClock::fixed();
        let later = clock.now() + chrono::Duration::seconds(5);
        assert_eq!(elapsed(clock.now(), later), Duration::ZERO);
    }
}
