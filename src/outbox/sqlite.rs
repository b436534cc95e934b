use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::outbox::model::{JoinStatus, OutboxJoin, OutboxMessage, OutboxStatus};
use crate::outbox::store::{validate_batch_size, OutboxStore};
use crate::sqltime;
use crate::time::Clock;

/// SQLite-backed [`OutboxStore`]. `claim_due` is a single atomic
/// `UPDATE ... WHERE id IN (SELECT ...) RETURNING` batch claim, the same
/// shape as the teacher's `claim_next_task`; the join counter updates in
/// `mark_dispatched`/`fail` run inside an explicit transaction, grounded on
/// `Storage::create_message_and_increment_count`.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> OutboxMessage {
    OutboxMessage {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str()).expect("corrupt outbox.id"),
        topic: row.get("topic"),
        payload: row.get("payload"),
        correlation_id: row.get("correlation_id"),
        due_time_utc: sqltime::decode(row.get::<String, _>("due_time_utc").as_str()),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        owner_token: row
            .get::<Option<String>, _>("owner_token")
            .map(|s| Uuid::parse_str(&s).expect("corrupt outbox.owner_token")),
        locked_until: sqltime::decode_opt(row.get("locked_until")),
        status: OutboxStatus::parse(row.get::<String, _>("status").as_str()),
        created_at: sqltime::decode(row.get::<String, _>("created_at").as_str()),
    }
}

fn row_to_join(row: &sqlx::sqlite::SqliteRow) -> OutboxJoin {
    OutboxJoin {
        join_id: Uuid::parse_str(row.get::<String, _>("join_id").as_str()).expect("corrupt outbox_joins.join_id"),
        tenant_id: row.get("tenant_id"),
        expected_steps: row.get("expected_steps"),
        completed_steps: row.get("completed_steps"),
        failed_steps: row.get("failed_steps"),
        status: JoinStatus::parse(row.get::<String, _>("status").as_str()),
        metadata: row.get("metadata"),
        created_utc: sqltime::decode(row.get::<String, _>("created_utc").as_str()),
        last_updated_utc: sqltime::decode(row.get::<String, _>("last_updated_utc").as_str()),
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn enqueue(
        &self,
        topic: &str,
        payload: &str,
        correlation_id: Option<&str>,
        due_time: Option<DateTime<Utc>>,
        clock: &dyn Clock,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = clock.now();
        let due = due_time.unwrap_or(now);

        sqlx::query(
            "INSERT INTO outbox (id, topic, payload, correlation_id, due_time_utc, retry_count, status, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, 'Ready', ?)",
        )
        .bind(id.to_string())
        .bind(topic)
        .bind(payload)
        .bind(correlation_id)
        .bind(sqltime::encode(due))
        .bind(sqltime::encode(now))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_due(
        &self,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<OutboxMessage>> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let rows = sqlx::query(
            "UPDATE outbox SET status = 'InProgress', owner_token = ?, locked_until = ? \
             WHERE id IN ( \
                 SELECT id FROM outbox WHERE status = 'Ready' AND due_time_utc <= ? \
                 ORDER BY due_time_utc ASC, rowid ASC LIMIT ? \
             ) RETURNING *",
        )
        .bind(owner.to_string())
        .bind(sqltime::encode(locked_until))
        .bind(sqltime::encode(now))
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn mark_dispatched(&self, owner: Uuid, id: Uuid, clock: &dyn Clock) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE outbox SET status = 'Acknowledged' WHERE id = ? AND owner_token = ?")
            .bind(id.to_string())
            .bind(owner.to_string())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        bump_join_counters(&mut tx, id, "completed_steps", clock.now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        owner: Uuid,
        id: Uuid,
        delay: Duration,
        last_error: &str,
        clock: &dyn Clock,
    ) -> Result<()> {
        let due = clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        sqlx::query(
            "UPDATE outbox SET status = 'Ready', due_time_utc = ?, retry_count = retry_count + 1, \
             last_error = ?, owner_token = NULL, locked_until = NULL \
             WHERE id = ? AND owner_token = ?",
        )
        .bind(sqltime::encode(due))
        .bind(last_error)
        .bind(id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, owner: Uuid, id: Uuid, last_error: &str, clock: &dyn Clock) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE outbox SET status = 'Failed', last_error = ? WHERE id = ? AND owner_token = ?")
            .bind(last_error)
            .bind(id.to_string())
            .bind(owner.to_string())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        bump_join_counters(&mut tx, id, "failed_steps", clock.now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reap_expired(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let result = sqlx::query(
            "UPDATE outbox SET status = 'Ready', owner_token = NULL, locked_until = NULL \
             WHERE id IN ( \
                 SELECT id FROM outbox WHERE status = 'InProgress' AND locked_until <= ? \
                 ORDER BY locked_until ASC LIMIT ? \
             )",
        )
        .bind(sqltime::encode(now))
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query("SELECT * FROM outbox WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    async fn create_join(
        &self,
        tenant_id: &str,
        expected_steps: i64,
        metadata: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<Uuid> {
        if expected_steps <= 0 {
            return Err(PlatformError::invalid("expectedSteps must be > 0"));
        }
        let join_id = Uuid::new_v4();
        let now = sqltime::encode(clock.now());
        sqlx::query(
            "INSERT INTO outbox_joins \
             (join_id, tenant_id, expected_steps, completed_steps, failed_steps, status, metadata, created_utc, last_updated_utc) \
             VALUES (?, ?, ?, 0, 0, 'Pending', ?, ?, ?)",
        )
        .bind(join_id.to_string())
        .bind(tenant_id)
        .bind(expected_steps)
        .bind(metadata)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(join_id)
    }

    async fn get_join(&self, join_id: Uuid) -> Result<Option<OutboxJoin>> {
        let row = sqlx::query("SELECT * FROM outbox_joins WHERE join_id = ?")
            .bind(join_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_join))
    }

    async fn attach(&self, join_id: Uuid, message_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO outbox_join_members (join_id, outbox_message_id, reported) VALUES (?, ?, 0) \
             ON CONFLICT (join_id, outbox_message_id) DO NOTHING",
        )
        .bind(join_id.to_string())
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_join(&self, join_id: Uuid, new_status: JoinStatus, clock: &dyn Clock) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_joins SET status = ?, last_updated_utc = ? \
             WHERE join_id = ? AND status = 'Pending' AND completed_steps + failed_steps = expected_steps",
        )
        .bind(new_status.as_str())
        .bind(sqltime::encode(clock.now()))
        .bind(join_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Increment `column` on every join `message_id` belongs to that hasn't
/// reported yet, then mark those memberships reported — invariant 5 requires
/// exactly one counter increment per member no matter how many times
/// `mark_dispatched`/`fail` race against a lost-and-reclaimed lease.
async fn bump_join_counters(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    message_id: Uuid,
    column: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let sql = format!(
        "UPDATE outbox_joins SET {column} = {column} + 1, last_updated_utc = ? \
         WHERE join_id IN (SELECT join_id FROM outbox_join_members WHERE outbox_message_id = ? AND reported = 0)"
    );
    sqlx::query(&sql)
        .bind(sqltime::encode(now))
        .bind(message_id.to_string())
        .execute(&mut **tx)
        .await?;

    sqlx::query("UPDATE outbox_join_members SET reported = 1 WHERE outbox_message_id = ? AND reported = 0")
        .bind(message_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{SystemClock, TestClock};

    async fn store() -> SqliteOutboxStore {
        SqliteOutboxStore::new(crate::storage::memory_pool().await)
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trips() {
        let store = store().await;
        let clock = SystemClock;
        let id = store.enqueue("topic", "payload", None, None, &clock).await.unwrap();

        let claimed = store
            .claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &clock)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, OutboxStatus::InProgress);
    }

    #[tokio::test]
    async fn claim_due_never_hands_a_row_to_two_owners() {
        let store = store().await;
        let clock = SystemClock;
        store.enqueue("topic", "p", None, None, &clock).await.unwrap();

        let first = store.claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap();
        let second = store.claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn claim_due_orders_by_due_time_then_insertion() {
        let store = store().await;
        let clock = TestClock::new(Utc::now());
        let later = clock.now() + chrono::Duration::seconds(60);
        let id_later = store.enqueue("t", "p", None, Some(later), &clock).await.unwrap();
        let id_earlier = store.enqueue("t", "p", None, None, &clock).await.unwrap();

        let claimed = store.claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &TestClock::new(later)).await.unwrap();
        assert_eq!(claimed[0].id, id_earlier);
        assert_eq!(claimed[1].id, id_later);
    }

    #[tokio::test]
    async fn reschedule_bumps_retry_count_without_touching_joins() {
        let store = store().await;
        let clock = SystemClock;
        let join = store.create_join("tenant", 1, None, &clock).await.unwrap();
        let id = store.enqueue("t", "p", None, None, &clock).await.unwrap();
        store.attach(join, id).await.unwrap();

        let owner = Uuid::new_v4();
        store.claim_due(10, Duration::from_secs(30), owner, &clock).await.unwrap();
        store.reschedule(owner, id, Duration::from_secs(5), "boom", &clock).await.unwrap();

        let msg = store.get(id).await.unwrap().unwrap();
        assert_eq!(msg.retry_count, 1);
        assert_eq!(msg.status, OutboxStatus::Ready);
        let join_row = store.get_join(join).await.unwrap().unwrap();
        assert_eq!(join_row.completed_steps, 0);
        assert_eq!(join_row.failed_steps, 0);
    }

    #[tokio::test]
    async fn mark_dispatched_by_non_owner_is_a_silent_no_op() {
        let store = store().await;
        let clock = SystemClock;
        let id = store.enqueue("t", "p", None, None, &clock).await.unwrap();
        store.claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap();

        store.mark_dispatched(Uuid::new_v4(), id, &clock).await.unwrap();
        let msg = store.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::InProgress);
    }

    // Scenario S1 — join fan-in.
    #[tokio::test]
    async fn s1_join_completes_once_all_members_report_and_not_before() {
        let store = store().await;
        let clock = SystemClock;
        let join = store.create_join("tenant", 2, None, &clock).await.unwrap();
        let a = store.enqueue("t", "a", None, None, &clock).await.unwrap();
        let b = store.enqueue("t", "b", None, None, &clock).await.unwrap();
        store.attach(join, a).await.unwrap();
        store.attach(join, b).await.unwrap();

        let owner = Uuid::new_v4();
        store.claim_due(10, Duration::from_secs(30), owner, &clock).await.unwrap();
        store.mark_dispatched(owner, a, &clock).await.unwrap();

        assert!(!store.finalize_join(join, JoinStatus::Completed, &clock).await.unwrap());

        store.mark_dispatched(owner, b, &clock).await.unwrap();
        let row = store.get_join(join).await.unwrap().unwrap();
        assert_eq!(row.completed_steps, 2);
        assert!(store.finalize_join(join, JoinStatus::Completed, &clock).await.unwrap());
    }

    #[tokio::test]
    async fn reap_expired_returns_lapsed_claims_to_ready() {
        let store = store().await;
        let clock = TestClock::new(Utc::now());
        store.enqueue("t", "p", None, None, &clock).await.unwrap();
        store.claim_due(10, Duration::from_secs(1), Uuid::new_v4(), &clock).await.unwrap();

        clock.advance(Duration::from_secs(2));
        let reaped = store.reap_expired(10, &clock).await.unwrap();
        assert_eq!(reaped, 1);
    }
}
