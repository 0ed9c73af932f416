//! Injectable clock for wall + monotonic time.
//!
//! Everything that reasons about durations (hysteresis, retry backoff,
//! cash-exit timeouts) takes a `Clock` handle so tests can drive time
//! forward deterministically.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for measuring elapsed intervals.
    fn monotonic(&self) -> Instant;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
    epoch: Instant,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
            epoch: Instant::now(),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn monotonic(&self) -> Instant {
        // Monotonic time is only compared against itself; the fixed epoch
        // keeps elapsed() at zero which is fine for unit tests.
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now_utc(), start);

        clock.advance(chrono::Duration::hours(3));
        assert_eq!(clock.now_utc(), start + chrono::Duration::hours(3));
    }
}
