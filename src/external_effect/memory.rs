use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::external_effect::model::{AttemptDecision, ExternalEffectRecord, ExternalEffectStatus};
use crate::external_effect::store::ExternalEffectStore;
use crate::time::Clock;

/// In-memory [`ExternalEffectStore`] conformance reference.
#[derive(Default)]
pub struct InMemoryExternalEffectStore {
    rows: Mutex<HashMap<(String, String), ExternalEffectRecord>>,
}

impl InMemoryExternalEffectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExternalEffectStore for InMemoryExternalEffectStore {
    async fn get_or_create(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        correlation_id: Option<&str>,
        outbox_message_id: Option<Uuid>,
        payload_hash: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<ExternalEffectRecord> {
        let now = clock.now();
        let mut rows = self.rows.lock().unwrap();
        let record = rows
            .entry((operation_name.to_string(), idempotency_key.to_string()))
            .or_insert_with(|| ExternalEffectRecord {
                operation_name: operation_name.to_string(),
                idempotency_key: idempotency_key.to_string(),
                status: ExternalEffectStatus::Pending,
                attempt_count: 0,
                locked_until: None,
                locked_by: None,
                external_ref_id: None,
                external_status: None,
                last_error: None,
                last_external_check_at: None,
                correlation_id: correlation_id.map(|s| s.to_string()),
                outbox_message_id,
                payload_hash: payload_hash.map(|s| s.to_string()),
                last_updated_at: now,
            });
        Ok(record.clone())
    }

    async fn get(&self, operation_name: &str, idempotency_key: &str) -> Result<Option<ExternalEffectRecord>> {
        Ok(self.rows.lock().unwrap().get(&(operation_name.to_string(), idempotency_key.to_string())).cloned())
    }

    async fn try_begin_attempt(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        owner: Uuid,
        lock_duration: Duration,
        clock: &dyn Clock,
    ) -> Result<AttemptDecision> {
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lock_duration).unwrap_or_default();
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&(operation_name.to_string(), idempotency_key.to_string())) {
            Some(r) if matches!(r.status, ExternalEffectStatus::Succeeded | ExternalEffectStatus::Failed) => {
                Ok(AttemptDecision::AlreadyCompleted)
            }
            Some(r) if r.status == ExternalEffectStatus::Pending || r.locked_until.map(|l| l <= now).unwrap_or(false) => {
                r.status = ExternalEffectStatus::InFlight;
                r.attempt_count += 1;
                r.locked_until = Some(locked_until);
                r.locked_by = Some(owner);
                r.last_updated_at = now;
                Ok(AttemptDecision::Ready { attempt_count: r.attempt_count })
            }
            Some(_) => Ok(AttemptDecision::Locked),
            None => Ok(AttemptDecision::Locked),
        }
    }

    async fn mark_succeeded(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        external_ref_id: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(operation_name.to_string(), idempotency_key.to_string())) {
            r.status = ExternalEffectStatus::Succeeded;
            r.external_ref_id = external_ref_id.map(|s| s.to_string());
            r.locked_until = None;
            r.locked_by = None;
            r.last_updated_at = clock.now();
        }
        Ok(())
    }

    async fn mark_failed(&self, operation_name: &str, idempotency_key: &str, last_error: &str, clock: &dyn Clock) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(operation_name.to_string(), idempotency_key.to_string())) {
            r.status = ExternalEffectStatus::Failed;
            r.last_error = Some(last_error.to_string());
            r.locked_until = None;
            r.locked_by = None;
            r.last_updated_at = clock.now();
        }
        Ok(())
    }

    async fn mark_pending_retry(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        last_error: &str,
        clock: &dyn Clock,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(operation_name.to_string(), idempotency_key.to_string())) {
            r.status = ExternalEffectStatus::Pending;
            r.last_error = Some(last_error.to_string());
            r.locked_until = None;
            r.locked_by = None;
            r.last_updated_at = clock.now();
        }
        Ok(())
    }

    async fn record_external_check(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        external_status: &str,
        clock: &dyn Clock,
    ) -> Result<()> {
        let now = clock.now();
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(operation_name.to_string(), idempotency_key.to_string())) {
            r.external_status = Some(external_status.to_string());
            r.last_external_check_at = Some(now);
            r.last_updated_at = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn matches_sqlite_cas_contract() {
        let store = InMemoryExternalEffectStore::new();
        let clock = SystemClock;
        store.get_or_create("op", "k", None, None, None, &clock).await.unwrap();
        let first = store.try_begin_attempt("op", "k", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        assert_eq!(first, AttemptDecision::Ready { attempt_count: 1 });
        let second = store.try_begin_attempt("op", "k", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        assert_eq!(second, AttemptDecision::Locked);
    }
}
