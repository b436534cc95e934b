//! `Execute()` orchestration (spec §4.5 steps 1-5): a generic async function
//! over caller-supplied `checkFn`/`executeFn` closures, the same shape as
//! the teacher's `retry_with_backoff` generic retry helper.

use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::config::UnknownCheckBehavior;
use crate::error::Result;
use crate::external_effect::model::{AttemptDecision, CheckOutcome, ExecuteOutcome, ExecuteResult, ExternalEffectStatus};
use crate::external_effect::store::ExternalEffectStore;
use crate::time::Clock;

pub struct ExecuteConfig {
    pub attempt_lock_duration: Duration,
    pub min_check_interval: Duration,
    pub unknown_check_behavior: UnknownCheckBehavior,
}

pub struct ExecuteRequest<'a> {
    pub operation_name: &'a str,
    pub idempotency_key: &'a str,
    pub owner: Uuid,
    pub correlation_id: Option<&'a str>,
    pub outbox_message_id: Option<Uuid>,
    pub payload_hash: Option<&'a str>,
}

/// Protect an external operation that cannot itself be transactional with
/// the local database, behind a per-key record. `check_fn` is only invoked
/// when there are prior attempts and the last check is stale; `execute_fn`
/// runs only once `TryBeginAttempt` grants the caller exclusive entry.
pub async fn execute<S, CheckFut, ExecFut>(
    store: &S,
    clock: &dyn Clock,
    request: ExecuteRequest<'_>,
    config: &ExecuteConfig,
    check_fn: Option<impl FnOnce() -> CheckFut>,
    execute_fn: impl FnOnce() -> ExecFut,
) -> Result<ExecuteResult>
where
    S: ExternalEffectStore + ?Sized,
    CheckFut: Future<Output = CheckOutcome>,
    ExecFut: Future<Output = ExecuteOutcome>,
{
    let ExecuteRequest { operation_name, idempotency_key, owner, correlation_id, outbox_message_id, payload_hash } = request;

    let record = store
        .get_or_create(operation_name, idempotency_key, correlation_id, outbox_message_id, payload_hash, clock)
        .await?;

    match record.status {
        ExternalEffectStatus::Succeeded => return Ok(ExecuteResult::AlreadyCompleted),
        ExternalEffectStatus::Failed => {
            return Ok(ExecuteResult::PermanentFailure(record.last_error.clone().unwrap_or_default()))
        }
        _ => {}
    }

    if record.attempt_count > 0 {
        let min_interval = chrono::Duration::from_std(config.min_check_interval).unwrap_or_default();
        let stale = record.last_external_check_at.map(|last| clock.now() - last >= min_interval).unwrap_or(true);

        if stale {
            if let Some(check_fn) = check_fn {
                match check_fn().await {
                    CheckOutcome::Confirmed => {
                        store.record_external_check(operation_name, idempotency_key, "Confirmed", clock).await?;
                        store.mark_succeeded(operation_name, idempotency_key, None, clock).await?;
                        return Ok(ExecuteResult::Completed);
                    }
                    CheckOutcome::Unknown => {
                        store.record_external_check(operation_name, idempotency_key, "Unknown", clock).await?;
                        if config.unknown_check_behavior == UnknownCheckBehavior::RetryLater {
                            return Ok(ExecuteResult::RetryScheduled);
                        }
                        // ExecuteAnyway falls through to TryBeginAttempt.
                    }
                }
            }
        }
    }

    let decision = store
        .try_begin_attempt(operation_name, idempotency_key, owner, config.attempt_lock_duration, clock)
        .await?;

    match decision {
        AttemptDecision::AlreadyCompleted => Ok(ExecuteResult::AlreadyCompleted),
        AttemptDecision::Locked => Ok(ExecuteResult::Locked),
        AttemptDecision::Ready { .. } => match execute_fn().await {
            ExecuteOutcome::Succeeded { external_ref_id } => {
                store.mark_succeeded(operation_name, idempotency_key, external_ref_id.as_deref(), clock).await?;
                Ok(ExecuteResult::Completed)
            }
            ExecuteOutcome::Failed { reason } => {
                store.mark_failed(operation_name, idempotency_key, &reason, clock).await?;
                Ok(ExecuteResult::PermanentFailure(reason))
            }
            ExecuteOutcome::Pending { reason } => {
                store.mark_pending_retry(operation_name, idempotency_key, &reason, clock).await?;
                Ok(ExecuteResult::RetryScheduled)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_effect::memory::InMemoryExternalEffectStore;
    use crate::time::SystemClock;
    use std::future::ready;

    fn config() -> ExecuteConfig {
        ExecuteConfig {
            attempt_lock_duration: Duration::from_secs(30),
            min_check_interval: Duration::from_secs(15),
            unknown_check_behavior: UnknownCheckBehavior::RetryLater,
        }
    }

    fn request(owner: Uuid) -> ExecuteRequest<'static> {
        ExecuteRequest {
            operation_name: "charge",
            idempotency_key: "order-1",
            owner,
            correlation_id: None,
            outbox_message_id: None,
            payload_hash: None,
        }
    }

    #[tokio::test]
    async fn successful_execute_is_terminal_and_idempotent_on_replay() {
        let store = InMemoryExternalEffectStore::new();
        let clock = SystemClock;
        let cfg = config();

        let result = execute(
            &store,
            &clock,
            request(Uuid::new_v4()),
            &cfg,
            None::<fn() -> std::future::Ready<CheckOutcome>>,
            || ready(ExecuteOutcome::Succeeded { external_ref_id: Some("ref-1".to_string()) }),
        )
        .await
        .unwrap();
        assert_eq!(result, ExecuteResult::Completed);

        let replay = execute(
            &store,
            &clock,
            request(Uuid::new_v4()),
            &cfg,
            None::<fn() -> std::future::Ready<CheckOutcome>>,
            || ready(ExecuteOutcome::Succeeded { external_ref_id: None }),
        )
        .await
        .unwrap();
        assert_eq!(replay, ExecuteResult::AlreadyCompleted);
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal() {
        let store = InMemoryExternalEffectStore::new();
        let clock = SystemClock;
        let cfg = config();

        let result = execute(
            &store,
            &clock,
            request(Uuid::new_v4()),
            &cfg,
            None::<fn() -> std::future::Ready<CheckOutcome>>,
            || ready(ExecuteOutcome::Failed { reason: "rejected".to_string() }),
        )
        .await
        .unwrap();
        assert_eq!(result, ExecuteResult::PermanentFailure("rejected".to_string()));

        let replay = execute(
            &store,
            &clock,
            request(Uuid::new_v4()),
            &cfg,
            None::<fn() -> std::future::Ready<CheckOutcome>>,
            || ready(ExecuteOutcome::Succeeded { external_ref_id: None }),
        )
        .await
        .unwrap();
        assert_eq!(replay, ExecuteResult::PermanentFailure("rejected".to_string()));
    }

    #[tokio::test]
    async fn pending_outcome_is_retry_scheduled_and_reopens_for_another_attempt() {
        let store = InMemoryExternalEffectStore::new();
        let clock = SystemClock;
        let cfg = config();

        let result = execute(
            &store,
            &clock,
            request(Uuid::new_v4()),
            &cfg,
            None::<fn() -> std::future::Ready<CheckOutcome>>,
            || ready(ExecuteOutcome::Pending { reason: "timeout".to_string() }),
        )
        .await
        .unwrap();
        assert_eq!(result, ExecuteResult::RetryScheduled);

        let record = store.get("charge", "order-1").await.unwrap().unwrap();
        assert_eq!(record.status, ExternalEffectStatus::Pending);
        assert_eq!(record.attempt_count, 1);
    }
}
