//! Wall-clock abstraction.
//!
//! Freshness, strategy selection and foreground throttling all depend on the
//! current time. Components read it through [`Clock`] so tests can move time
//! forward deterministically with [`ManualClock`].

use std::sync::Mutex;
use std::time::Duration;

use time::{Date, OffsetDateTime};

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant.
    fn now(&self) -> OffsetDateTime;

    /// Current calendar day.
    fn today(&self) -> Date {
        self.now().date()
    }
}

/// The real system clock (UTC).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Jump to a specific instant.
    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2024-05-01 23:55 UTC));
        assert_eq!(clock.today(), date!(2024 - 05 - 01));

        clock.advance(Duration::from_secs(10 * 60));
        assert_eq!(clock.now(), datetime!(2024-05-02 00:05 UTC));
        assert_eq!(clock.today(), date!(2024 - 05 - 02));
    }
}
