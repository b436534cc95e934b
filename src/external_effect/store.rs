use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::external_effect::model::{AttemptDecision, ExternalEffectRecord};
use crate::time::Clock;

/// Persisted state for an at-most-once external call, keyed by
/// `(OperationName, IdempotencyKey)` (spec §4.5).
#[async_trait]
pub trait ExternalEffectStore: Send + Sync {
    /// Load the record, creating a fresh `Pending` one on first sight.
    async fn get_or_create(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        correlation_id: Option<&str>,
        outbox_message_id: Option<Uuid>,
        payload_hash: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<ExternalEffectRecord>;

    async fn get(&self, operation_name: &str, idempotency_key: &str) -> Result<Option<ExternalEffectRecord>>;

    /// Transactional compare-and-set: advance to `InFlight`, increment
    /// `AttemptCount`, set `LockedUntil`/`LockedBy`. No-op (returns
    /// `Locked`/`AlreadyCompleted`) if the record isn't eligible.
    async fn try_begin_attempt(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        owner: Uuid,
        lock_duration: Duration,
        clock: &dyn Clock,
    ) -> Result<AttemptDecision>;

    async fn mark_succeeded(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        external_ref_id: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<()>;

    async fn mark_failed(&self, operation_name: &str, idempotency_key: &str, last_error: &str, clock: &dyn Clock) -> Result<()>;

    /// Retryable outcome: back to `Pending`, clears the lock, keeps
    /// `AttemptCount`.
    async fn mark_pending_retry(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        last_error: &str,
        clock: &dyn Clock,
    ) -> Result<()>;

    /// Stamps the result of a `checkFn` probe without transitioning status
    /// (the caller does that separately via `mark_succeeded`).
    async fn record_external_check(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        external_status: &str,
        clock: &dyn Clock,
    ) -> Result<()>;
}
