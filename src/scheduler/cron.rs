//! Cron grammar evaluation for job materialization (spec §4.4). Accepts
//! both the standard 5-field grammar and the 6-field (seconds-first)
//! variant, delegated entirely to `croner`.

use chrono::{DateTime, Utc};
use croner::Cron;

use crate::error::{PlatformError, Result};

/// Validate `expr` parses, without computing an occurrence. Used by
/// `CreateOrUpdateJob` to reject a bad schedule before it is persisted.
pub fn validate(expr: &str) -> Result<()> {
    Cron::new(expr)
        .parse()
        .map(|_| ())
        .map_err(|e| PlatformError::invalid(format!("invalid cron schedule {expr:?}: {e}")))
}

/// The next occurrence of `expr` strictly after `after`. Used to advance
/// `NextDueTime` once a due occurrence has already been materialized into a
/// run, so the same instant is never matched twice.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = Cron::new(expr)
        .parse()
        .map_err(|e| PlatformError::invalid(format!("invalid cron schedule {expr:?}: {e}")))?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| PlatformError::invalid(format!("cron schedule {expr:?} has no future occurrence: {e}")))
}

/// The next occurrence of `expr` at-or-after `after` — `after` itself
/// counts if it matches the schedule exactly. Used to seed a freshly
/// created/updated job's initial `NextDueTime`, so a schedule that is due
/// immediately is materialized on the very next sweep rather than skipped
/// to its following occurrence (spec §8 scenario S5).
pub fn next_at_or_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = Cron::new(expr)
        .parse()
        .map_err(|e| PlatformError::invalid(format!("invalid cron schedule {expr:?}: {e}")))?;
    cron.find_next_occurrence(&after, true)
        .map_err(|e| PlatformError::invalid(format!("cron schedule {expr:?} has no future occurrence: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_every_five_minutes_advances_to_next_boundary() {
        let at = "2026-01-01T00:00:01Z".parse::<DateTime<Utc>>().unwrap();
        let next = next_after("*/5 * * * *", at).unwrap();
        assert_eq!(next, "2026-01-01T00:05:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn next_at_or_after_matches_the_instant_itself_when_due() {
        let at = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = next_at_or_after("*/5 * * * *", at).unwrap();
        assert_eq!(next, at);
    }

    #[test]
    fn six_field_seconds_grammar_is_accepted() {
        assert!(validate("*/30 * * * * *").is_ok());
    }

    #[test]
    fn malformed_expression_is_invalid_argument() {
        assert!(validate("not a cron").is_err());
    }
}
