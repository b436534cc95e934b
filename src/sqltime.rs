//! RFC3339 timestamp (de)serialization shared by every SQLite-backed store.
//!
//! Timestamps are stored as TEXT rather than relying on `sqlx`'s `chrono`
//! feature to decode them, matching the teacher's `Utc::now().to_rfc3339()`
//! convention throughout `storage/mod.rs` — explicit and easy to inspect
//! with a plain `sqlite3` shell.

use chrono::{DateTime, Utc};

pub fn encode(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn encode_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(encode)
}

/// Parse a timestamp written by [`encode`]. Panics on malformed input,
/// which would indicate the row was corrupted outside of this crate's own
/// writes — not a condition callers need to recover from.
pub fn decode(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap_or_else(|e| panic!("corrupt timestamp column {s:?}: {e}"))
        .with_timezone(&Utc)
}

pub fn decode_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| decode(&s))
}
