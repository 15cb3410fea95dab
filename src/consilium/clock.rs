//! Deterministic time source for the engine.
//!
//! Every component that needs the current time (event timestamps, turn
//! records, freshness checks) receives an `Arc<dyn Clock>` instead of calling
//! `Utc::now()` directly. Production code uses [`SystemClock`]; tests inject a
//! [`ManualClock`] and advance it explicitly so detector windows and latency
//! figures are reproducible.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for the engine.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation backed by `chrono::Utc`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-cranked clock for tests.
///
/// Starts at a fixed instant and only moves when [`advance`](ManualClock::advance)
/// is called, so time-dependent assertions never race the host clock.
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Move the clock forward by `millis` milliseconds.
    pub fn advance(&self, millis: i64) {
        let mut current = self.current.lock().unwrap();
        *current = *current + Duration::milliseconds(millis);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance(1_500);
        assert_eq!((clock.now() - start).num_milliseconds(), 1_500);
    }
}
