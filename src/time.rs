//! The single authoritative "now" used by every component (spec §2.1, §6).
//!
//! [`Clock`] separates wall-clock time (used for `DueTimeUtc`, `ExpiresAt`,
//! persisted timestamps — and therefore swappable in tests) from monotonic
//! time (used for deadlines, so a wall-clock jump never shortens or
//! lengthens an in-flight wait — spec §5 "Cancellation").

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Provider contract for "now": wall-clock `now()` plus a monotonic instant
/// for deadline arithmetic, matching spec §6's Time source contract.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic_now(&self) -> Instant;
}

/// The real system clock, used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that can be advanced manually, for deterministic tests of the
/// claim/reap/lease-expiry state machines (spec §8 S1/S2/S4/S5).
#[derive(Clone)]
pub struct TestClock {
    // Stored as millis-since-epoch so the clock is `Clone` + `Sync` without
    // needing a lock around `DateTime`.
    millis: Arc<AtomicI64>,
    started: Instant,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
            started: Instant::now(),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.millis
            .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, when: DateTime<Utc>) {
        self.millis.store(when.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }

    fn monotonic_now(&self) -> Instant {
        // The monotonic clock and the wall clock advance independently in
        // real deployments; for tests it is enough that this never goes
        // backwards, so we anchor it to process start.
        self.started
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_on_demand() {
        let start = Utc::now();
        let clock = TestClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(30));
        assert!(clock.now() > start);
    }
}
