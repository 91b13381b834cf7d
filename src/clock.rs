//! Clock
//!
//! `now()` is injected rather than called directly so tests can pin time and
//! assert on exact boundary behavior (§8's S1/S5 scenarios depend on this).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock. Used by `Engine::open` unless a test clock is
/// injected via `Engine::open_with`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that can be advanced deterministically from tests.
#[derive(Debug)]
pub struct FixedClock {
    micros: AtomicI64,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Advance the clock by `seconds` and return the new instant.
    pub fn advance_secs(&self, seconds: i64) -> DateTime<Utc> {
        let updated = self.micros.fetch_add(seconds * 1_000_000, Ordering::SeqCst) + seconds * 1_000_000;
        DateTime::from_timestamp_micros(updated).expect("valid timestamp")
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::SeqCst);
        DateTime::from_timestamp_micros(micros).expect("valid timestamp")
    }
}
