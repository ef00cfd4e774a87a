//! Wall-clock abstraction.
//!
//! Health records, cache entries and queued operations are persisted, so
//! their timestamps are wall-clock `DateTime<Utc>` rather than `Instant`.
//! Everything that reads the time takes a [`Clock`] so tests can move it.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_delta(by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a std duration, saturating at the chrono maximum.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Time elapsed from `since` to `now`; zero if `since` is in the future.
pub fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_millis(30_000));
        assert_eq!(elapsed(clock.now(), start), Duration::from_millis(30_000));
    }

    #[test]
    fn test_elapsed_never_negative() {
        let now = Utc::now();
        let later = now + to_delta(Duration::from_secs(5));
        assert_eq!(elapsed(now, later), Duration::ZERO);
    }
}
