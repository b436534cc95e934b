use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::outbox::model::{JoinStatus, OutboxJoin, OutboxMessage};
use crate::time::Clock;

/// Transactional at-least-once message dispatch with claim/ack/abandon/fail
/// semantics, retries, and fan-in join coordination (spec §4.2).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a Ready row. `due_time` defaults to `clock.now()`.
    async fn enqueue(
        &self,
        topic: &str,
        payload: &str,
        correlation_id: Option<&str>,
        due_time: Option<DateTime<Utc>>,
        clock: &dyn Clock,
    ) -> Result<Uuid>;

    /// Atomically claim up to `batch_size` Ready rows due now, ordered by
    /// `DueTime` ascending then insertion order. `batch_size <= 0` is an
    /// `InvalidArgument`. Never returns a row to more than one owner.
    async fn claim_due(
        &self,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<OutboxMessage>>;

    /// Transition `id` to Acknowledged, incrementing any join it is a member
    /// of in the same atomic step. Non-owner calls are a silent no-op.
    async fn mark_dispatched(&self, owner: Uuid, id: Uuid, clock: &dyn Clock) -> Result<()>;

    /// Return `id` to Ready with a new due time, bumping `RetryCount`. Does
    /// NOT touch join counters (transient failures must not count as
    /// Failed). Non-owner calls are a silent no-op.
    async fn reschedule(&self, owner: Uuid, id: Uuid, delay: Duration, last_error: &str, clock: &dyn Clock)
        -> Result<()>;

    /// Terminal Failed, incrementing any join `id` is a member of in the
    /// same atomic step. Non-owner calls are a silent no-op.
    async fn fail(&self, owner: Uuid, id: Uuid, last_error: &str, clock: &dyn Clock) -> Result<()>;

    /// Return to Ready any InProgress row whose lock has expired, with no
    /// owner check. Returns the number of rows reaped.
    async fn reap_expired(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>>;

    // ── Join / fan-in (spec §4.2.1) ─────────────────────────────────────

    async fn create_join(&self, tenant_id: &str, expected_steps: i64, metadata: Option<&str>, clock: &dyn Clock)
        -> Result<Uuid>;

    async fn get_join(&self, join_id: Uuid) -> Result<Option<OutboxJoin>>;

    /// Attach `message_id` as a member of `join_id` (many-to-many).
    async fn attach(&self, join_id: Uuid, message_id: Uuid) -> Result<()>;

    /// Transition a join out of Pending. Only succeeds if
    /// `Completed + Failed == Expected` and the join is still Pending.
    async fn finalize_join(&self, join_id: Uuid, new_status: JoinStatus, clock: &dyn Clock) -> Result<bool>;
}

pub(crate) fn validate_batch_size(batch_size: u32) -> Result<()> {
    if batch_size == 0 {
        return Err(crate::error::PlatformError::invalid("batchSize must be > 0"));
    }
    Ok(())
}
