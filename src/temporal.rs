//! Temporal Utilities (C2)
//!
//! Bi-temporal validity windows (`valid_from`/`valid_until`) and the
//! point-in-time predicates built on top of them. Every query that needs to
//! ask "what did we believe at time T" goes through `PointInTime` rather than
//! hand-built SQL, so the whitelist of comparable columns lives in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A half-open validity window: valid from `from` (inclusive) until `until`
/// (exclusive), or forever if `until` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    pub fn from_now(now: DateTime<Utc>) -> Self {
        Self {
            valid_from: now,
            valid_until: None,
        }
    }

    /// Whether this window covers `at`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.valid_from && self.valid_until.is_none_or(|until| at < until)
    }

    /// Whether this window is still open (no end has been recorded).
    pub fn is_open(&self) -> bool {
        self.valid_until.is_none()
    }

    /// Close the window at `at`. No-op semantics are the caller's concern —
    /// this just overwrites `valid_until`.
    pub fn close(&mut self, at: DateTime<Utc>) {
        self.valid_until = Some(at);
    }
}

/// The point at which a recall query evaluates fact validity. `Latest` is
/// the common case (active facts only); `At` supports historical queries
/// ("what was true on 2025-01-01").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointInTime {
    Latest,
    At(DateTime<Utc>),
}

impl PointInTime {
    /// Resolve to a concrete instant given the current time.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            PointInTime::Latest => now,
            PointInTime::At(t) => *t,
        }
    }
}

/// A SQL fragment plus bound parameters for filtering rows by validity at a
/// given instant. Built here rather than string-concatenated at call sites
/// so the column names are a fixed whitelist, never user input.
pub struct TemporalPredicate {
    pub sql: &'static str,
    pub at: DateTime<Utc>,
}

/// Build the `valid_from <= ? AND (valid_until IS NULL OR valid_until > ?)`
/// predicate for the given point in time. Callers bind `at` twice, once per
/// placeholder, in column order.
pub fn predicate_for(point: PointInTime, now: DateTime<Utc>) -> TemporalPredicate {
    TemporalPredicate {
        sql: "valid_from <= ?1 AND (valid_until IS NULL OR valid_until > ?1)",
        at: point.resolve(now),
    }
}

/// Parse an RFC3339 timestamp, as stored by the storage layer. Centralized
/// so every row-to-struct decoder reports the same error shape on failure.
pub fn parse_timestamp(raw: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::error::EngineError::internal(format!("bad timestamp '{raw}': {e}")))
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn open_window_contains_everything_after_start() {
        let w = ValidityWindow {
            valid_from: t(100),
            valid_until: None,
        };
        assert!(!w.contains(t(50)));
        assert!(w.contains(t(100)));
        assert!(w.contains(t(1_000_000)));
        assert!(w.is_open());
    }

    #[test]
    fn closed_window_excludes_the_end_instant() {
        let w = ValidityWindow {
            valid_from: t(100),
            valid_until: Some(t(200)),
        };
        assert!(w.contains(t(199)));
        assert!(!w.contains(t(200)));
        assert!(!w.is_open());
    }

    #[test]
    fn point_in_time_resolves() {
        assert_eq!(PointInTime::Latest.resolve(t(5)), t(5));
        assert_eq!(PointInTime::At(t(1)).resolve(t(5)), t(1));
    }

    #[test]
    fn timestamp_roundtrip() {
        let now = t(123_456);
        let formatted = format_timestamp(now);
        assert_eq!(parse_timestamp(&formatted).unwrap(), now);
    }
}
