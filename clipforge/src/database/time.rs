//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as RFC 3339 `TEXT` in UTC. With a fixed `+00:00`
//! offset these strings order lexicographically, which the stale-row
//! cutoff predicates rely on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Current time as an RFC 3339 UTC string.
#[inline]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// RFC 3339 UTC string for `age` before now, used as a staleness cutoff.
pub fn cutoff_rfc3339(age: Duration) -> String {
    let age = ChronoDuration::from_std(age).unwrap_or(ChronoDuration::MAX);
    (Utc::now() - age).to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp, if present and well-formed.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
