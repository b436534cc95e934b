use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared lifecycle for job runs and timers (spec §3). Unlike the outbox's
/// `Failed`/`Acknowledged` terminal pair, the scheduler has no permanent
/// failure state of its own — a handler that fails a run abandons it, and
/// `ReapExpired` recovers lapsed claims the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Claimed,
    Acknowledged,
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Claimed => "Claimed",
            RunStatus::Acknowledged => "Acknowledged",
            RunStatus::Abandoned => "Abandoned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Claimed" => RunStatus::Claimed,
            "Acknowledged" => RunStatus::Acknowledged,
            "Abandoned" => RunStatus::Abandoned,
            _ => RunStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub topic: String,
    pub payload: String,
    pub cron_schedule: String,
    pub next_due_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub scheduled_time: DateTime<Utc>,
    pub status: RunStatus,
    pub owner_token: Option<Uuid>,
    pub locked_until: Option<DateTime<Utc>>,
    /// Not persisted on the row itself; joined in from `jobs` at claim time
    /// so dispatchers don't need a second round-trip to route the handler.
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub topic: String,
    pub payload: String,
    pub due_time: DateTime<Utc>,
    pub status: RunStatus,
    pub owner_token: Option<Uuid>,
    pub locked_until: Option<DateTime<Utc>>,
}
