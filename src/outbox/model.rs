use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbox message lifecycle state (spec §3). Terminal states (`Failed`,
/// `Acknowledged`) are never reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Ready,
    InProgress,
    Failed,
    Acknowledged,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Ready => "Ready",
            OutboxStatus::InProgress => "InProgress",
            OutboxStatus::Failed => "Failed",
            OutboxStatus::Acknowledged => "Acknowledged",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "InProgress" => OutboxStatus::InProgress,
            "Failed" => OutboxStatus::Failed,
            "Acknowledged" => OutboxStatus::Acknowledged,
            _ => OutboxStatus::Ready,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub due_time_utc: DateTime<Utc>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub owner_token: Option<Uuid>,
    pub locked_until: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
}

/// Fan-in completion policy evaluated by the `join.wait` handler (spec
/// §4.2.1). `fail_if_any_step_failed = true` routes to the `onFail`
/// follow-up the moment any member fails; `false` waits for all members and
/// only fails the join if every member failed... in practice callers almost
/// always want the former, but the flag is explicit per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCompletionPolicy {
    pub fail_if_any_step_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Pending => "Pending",
            JoinStatus::Completed => "Completed",
            JoinStatus::Failed => "Failed",
            JoinStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Completed" => JoinStatus::Completed,
            "Failed" => JoinStatus::Failed,
            "Cancelled" => JoinStatus::Cancelled,
            _ => JoinStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxJoin {
    pub join_id: Uuid,
    pub tenant_id: String,
    pub expected_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
    pub status: JoinStatus,
    pub metadata: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub last_updated_utc: DateTime<Utc>,
}

impl OutboxJoin {
    /// Invariant 5: `Completed + Failed <= Expected` at all times.
    pub fn reported_steps(&self) -> i64 {
        self.completed_steps + self.failed_steps
    }

    pub fn is_awaiting_members(&self) -> bool {
        self.reported_steps() < self.expected_steps
    }
}
