//! Monotonic + wall time and random-safe request IDs.
//!
//! The rest of the core never calls `chrono::Utc::now()` or
//! `std::time::Instant::now()` directly — everything goes through a `Clock`
//! so tests can freeze time and assert ordering without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Abstracts wall-clock and monotonic time so `JobManager`/`ApprovalLedger`
/// tests can control scheduling without real sleeps.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that can be manually advanced, for deterministic tests of
/// TTL expiry, idempotency windows, and progress ordering.
pub struct FakeClock {
    offset_ms: AtomicI64,
    base: DateTime<Utc>,
    started: Instant,
}

impl FakeClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            base,
            started: Instant::now(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }

    fn monotonic(&self) -> Instant {
        self.started + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst) as u64)
    }
}

/// Generates a fresh request/job/approval id. Centralized so the
/// format can change in one place (the spec never pins a format
/// beyond "opaque string").
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically_and_in_wall_time() {
        let clock = FakeClock::new(Utc::now());
        let t0 = clock.now_utc();
        let m0 = clock.monotonic();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now_utc();
        let m1 = clock.monotonic();
        assert_eq!((t1 - t0).num_seconds(), 5);
        assert!(m1 > m0);
    }

    #[test]
    fn new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}
