use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbox record lifecycle (spec §3). `Dead` is reachable from `Processing`
/// via `MarkDead`/`Fail` and is recoverable via `Revive`, unlike the
/// outbox's one-way terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Seen => "Seen",
            InboxStatus::Processing => "Processing",
            InboxStatus::Done => "Done",
            InboxStatus::Dead => "Dead",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Processing" => InboxStatus::Processing,
            "Done" => InboxStatus::Done,
            "Dead" => InboxStatus::Dead,
            _ => InboxStatus::Seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub message_id: String,
    pub source: String,
    pub topic: Option<String>,
    pub payload: Option<String>,
    pub hash: Option<String>,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub status: InboxStatus,
    pub owner_token: Option<Uuid>,
    pub locked_until: Option<DateTime<Utc>>,
    pub due_time_utc: Option<DateTime<Utc>>,
}

pub(crate) fn validate_key(message_id: &str, source: &str) -> crate::error::Result<()> {
    if message_id.trim().is_empty() {
        return Err(crate::error::PlatformError::invalid("messageId must not be null/whitespace"));
    }
    if source.trim().is_empty() {
        return Err(crate::error::PlatformError::invalid("source must not be null/whitespace"));
    }
    Ok(())
}
