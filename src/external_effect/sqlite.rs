use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::external_effect::model::{AttemptDecision, ExternalEffectRecord, ExternalEffectStatus};
use crate::external_effect::store::ExternalEffectStore;
use crate::sqltime;
use crate::time::Clock;

/// SQLite-backed [`ExternalEffectStore`]. `try_begin_attempt` is a single
/// `UPDATE ... WHERE ... RETURNING` CAS, the same idiom as the lease store's
/// `acquire`; a miss is disambiguated into `Locked` vs `AlreadyCompleted`
/// with one follow-up read.
#[derive(Clone)]
pub struct SqliteExternalEffectStore {
    pool: SqlitePool,
}

impl SqliteExternalEffectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> ExternalEffectRecord {
    ExternalEffectRecord {
        operation_name: row.get("operation_name"),
        idempotency_key: row.get("idempotency_key"),
        status: ExternalEffectStatus::parse(row.get::<String, _>("status").as_str()),
        attempt_count: row.get("attempt_count"),
        locked_until: sqltime::decode_opt(row.get("locked_until")),
        locked_by: row
            .get::<Option<String>, _>("locked_by")
            .map(|s| Uuid::parse_str(&s).expect("corrupt external_side_effects.locked_by")),
        external_ref_id: row.get("external_ref_id"),
        external_status: row.get("external_status"),
        last_error: row.get("last_error"),
        last_external_check_at: sqltime::decode_opt(row.get("last_external_check_at")),
        correlation_id: row.get("correlation_id"),
        outbox_message_id: row
            .get::<Option<String>, _>("outbox_message_id")
            .map(|s| Uuid::parse_str(&s).expect("corrupt external_side_effects.outbox_message_id")),
        payload_hash: row.get("payload_hash"),
        last_updated_at: sqltime::decode(row.get::<String, _>("last_updated_at").as_str()),
    }
}

#[async_trait]
impl ExternalEffectStore for SqliteExternalEffectStore {
    async fn get_or_create(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        correlation_id: Option<&str>,
        outbox_message_id: Option<Uuid>,
        payload_hash: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<ExternalEffectRecord> {
        let now = sqltime::encode(clock.now());
        sqlx::query(
            "INSERT INTO external_side_effects \
                 (operation_name, idempotency_key, status, attempt_count, correlation_id, outbox_message_id, payload_hash, last_updated_at) \
             VALUES (?, ?, 'Pending', 0, ?, ?, ?, ?) \
             ON CONFLICT (operation_name, idempotency_key) DO NOTHING",
        )
        .bind(operation_name)
        .bind(idempotency_key)
        .bind(correlation_id)
        .bind(outbox_message_id.map(|u| u.to_string()))
        .bind(payload_hash)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(self.get(operation_name, idempotency_key).await?.expect("row just inserted or already present"))
    }

    async fn get(&self, operation_name: &str, idempotency_key: &str) -> Result<Option<ExternalEffectRecord>> {
        let row = sqlx::query("SELECT * FROM external_side_effects WHERE operation_name = ? AND idempotency_key = ?")
            .bind(operation_name)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
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

        let row = sqlx::query(
            "UPDATE external_side_effects \
             SET status = 'InFlight', attempt_count = attempt_count + 1, locked_until = ?, locked_by = ?, last_updated_at = ? \
             WHERE operation_name = ? AND idempotency_key = ? \
               AND (status = 'Pending' OR (status = 'InFlight' AND locked_until <= ?)) \
             RETURNING attempt_count",
        )
        .bind(sqltime::encode(locked_until))
        .bind(owner.to_string())
        .bind(sqltime::encode(now))
        .bind(operation_name)
        .bind(idempotency_key)
        .bind(sqltime::encode(now))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let attempt_count: i64 = row.get(0);
            return Ok(AttemptDecision::Ready { attempt_count });
        }

        match self.get(operation_name, idempotency_key).await? {
            Some(r) if matches!(r.status, ExternalEffectStatus::Succeeded | ExternalEffectStatus::Failed) => {
                Ok(AttemptDecision::AlreadyCompleted)
            }
            _ => Ok(AttemptDecision::Locked),
        }
    }

    async fn mark_succeeded(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        external_ref_id: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE external_side_effects SET status = 'Succeeded', external_ref_id = ?, locked_until = NULL, \
             locked_by = NULL, last_updated_at = ? WHERE operation_name = ? AND idempotency_key = ?",
        )
        .bind(external_ref_id)
        .bind(sqltime::encode(clock.now()))
        .bind(operation_name)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, operation_name: &str, idempotency_key: &str, last_error: &str, clock: &dyn Clock) -> Result<()> {
        sqlx::query(
            "UPDATE external_side_effects SET status = 'Failed', last_error = ?, locked_until = NULL, \
             locked_by = NULL, last_updated_at = ? WHERE operation_name = ? AND idempotency_key = ?",
        )
        .bind(last_error)
        .bind(sqltime::encode(clock.now()))
        .bind(operation_name)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_pending_retry(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        last_error: &str,
        clock: &dyn Clock,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE external_side_effects SET status = 'Pending', last_error = ?, locked_until = NULL, \
             locked_by = NULL, last_updated_at = ? WHERE operation_name = ? AND idempotency_key = ?",
        )
        .bind(last_error)
        .bind(sqltime::encode(clock.now()))
        .bind(operation_name)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_external_check(
        &self,
        operation_name: &str,
        idempotency_key: &str,
        external_status: &str,
        clock: &dyn Clock,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE external_side_effects SET external_status = ?, last_external_check_at = ?, last_updated_at = ? \
             WHERE operation_name = ? AND idempotency_key = ?",
        )
        .bind(external_status)
        .bind(sqltime::encode(clock.now()))
        .bind(sqltime::encode(clock.now()))
        .bind(operation_name)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{SystemClock, TestClock};

    async fn store() -> SqliteExternalEffectStore {
        SqliteExternalEffectStore::new(crate::storage::memory_pool().await)
    }

    #[tokio::test]
    async fn first_attempt_is_ready_second_concurrent_attempt_is_locked() {
        let store = store().await;
        let clock = SystemClock;
        store.get_or_create("op", "key1", None, None, None, &clock).await.unwrap();

        let first = store.try_begin_attempt("op", "key1", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        assert_eq!(first, AttemptDecision::Ready { attempt_count: 1 });

        let second = store.try_begin_attempt("op", "key1", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        assert_eq!(second, AttemptDecision::Locked);
    }

    #[tokio::test]
    async fn expired_lock_can_be_retaken() {
        let store = store().await;
        let clock = TestClock::new(chrono::Utc::now());
        store.get_or_create("op", "key1", None, None, None, &clock).await.unwrap();
        store.try_begin_attempt("op", "key1", Uuid::new_v4(), Duration::from_secs(1), &clock).await.unwrap();

        clock.advance(Duration::from_secs(2));
        let retaken = store.try_begin_attempt("op", "key1", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        assert_eq!(retaken, AttemptDecision::Ready { attempt_count: 2 });
    }

    #[tokio::test]
    async fn succeeded_record_reports_already_completed() {
        let store = store().await;
        let clock = SystemClock;
        store.get_or_create("op", "key1", None, None, None, &clock).await.unwrap();
        store.try_begin_attempt("op", "key1", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        store.mark_succeeded("op", "key1", Some("ref-1"), &clock).await.unwrap();

        let decision = store.try_begin_attempt("op", "key1", Uuid::new_v4(), Duration::from_secs(30), &clock).await.unwrap();
        assert_eq!(decision, AttemptDecision::AlreadyCompleted);
    }
}
