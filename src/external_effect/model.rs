use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External side-effect lifecycle (spec §4.5). Terminal once `Succeeded` or
/// `Failed` — counters (`AttemptCount`) are monotone even though the status
/// itself can cycle `InFlight` → `Pending` on a retryable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalEffectStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl ExternalEffectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalEffectStatus::Pending => "Pending",
            ExternalEffectStatus::InFlight => "InFlight",
            ExternalEffectStatus::Succeeded => "Succeeded",
            ExternalEffectStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "InFlight" => ExternalEffectStatus::InFlight,
            "Succeeded" => ExternalEffectStatus::Succeeded,
            "Failed" => ExternalEffectStatus::Failed,
            _ => ExternalEffectStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEffectRecord {
    pub operation_name: String,
    pub idempotency_key: String,
    pub status: ExternalEffectStatus,
    pub attempt_count: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<Uuid>,
    pub external_ref_id: Option<String>,
    pub external_status: Option<String>,
    pub last_error: Option<String>,
    pub last_external_check_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub outbox_message_id: Option<Uuid>,
    pub payload_hash: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

/// `TryBeginAttempt`'s CAS outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Ready { attempt_count: i64 },
    Locked,
    AlreadyCompleted,
}

/// `checkFn`'s verdict on whether the remote system already completed the
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Confirmed,
    Unknown,
}

/// `executeFn`'s verdict, mapped onto the record's terminal/retry states.
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    Succeeded { external_ref_id: Option<String> },
    Failed { reason: String },
    Pending { reason: String },
}

/// What `execute` reports back to the caller (spec §4.5 step numbering).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteResult {
    AlreadyCompleted,
    PermanentFailure(String),
    Completed,
    RetryScheduled,
    Locked,
}
