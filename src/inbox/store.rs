use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::inbox::model::InboxRecord;
use crate::time::Clock;

/// Idempotent, at-most-once message intake with deduplication and
/// dead-lettering (spec §4.3). Keyed by `(message_id, source)`.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Atomic upsert: inserts a new `Seen` row on first sight, otherwise
    /// bumps `LastSeenUtc`/`Attempts`. Returns `true` iff `ProcessedUtc` is
    /// already set — the caller's signal to skip reprocessing.
    async fn already_processed(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<bool>;

    /// Upsert-insert used by transports that carry a payload alongside the
    /// dedup key, as opposed to `already_processed`'s bare dedup check.
    async fn enqueue(
        &self,
        message_id: &str,
        source: &str,
        topic: &str,
        payload: &str,
        hash: Option<&str>,
        due_time: Option<DateTime<Utc>>,
        clock: &dyn Clock,
    ) -> Result<()>;

    /// Atomically claim up to `batch_size` Seen rows due now, transitioning
    /// them to Processing. Mirrors outbox `ClaimDue` ordering and exclusivity.
    async fn claim_due(
        &self,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<InboxRecord>>;

    /// Processing → Done, stamping `ProcessedUtc`. Non-owner calls are a
    /// silent no-op.
    async fn mark_processed(&self, owner: Uuid, message_id: &str, source: &str, clock: &dyn Clock) -> Result<()>;

    /// Processing → Seen, releasing the claim early for retry. Non-owner
    /// calls are a silent no-op.
    async fn abandon(&self, owner: Uuid, message_id: &str, source: &str) -> Result<()>;

    /// Processing → Dead (terminal until revived). Non-owner calls are a
    /// silent no-op.
    async fn mark_dead(&self, owner: Uuid, message_id: &str, source: &str) -> Result<()>;

    /// Dead → Seen, making the row claimable again. No owner check —
    /// administrative recovery.
    async fn revive(&self, message_id: &str, source: &str) -> Result<()>;

    /// Return to Seen any Processing row whose lock has expired.
    async fn reap_expired(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64>;

    async fn get(&self, message_id: &str, source: &str) -> Result<Option<InboxRecord>>;
}
