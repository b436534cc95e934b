use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::inbox::model::{validate_key, InboxRecord, InboxStatus};
use crate::inbox::store::InboxStore;
use crate::outbox::store::validate_batch_size;
use crate::sqltime;
use crate::time::Clock;

/// SQLite-backed [`InboxStore`]. Dedup is an `INSERT ... ON CONFLICT DO
/// UPDATE ... RETURNING` upsert, the same idiom the teacher's
/// `mailbox/storage.rs` uses for `INSERT OR IGNORE` sends, generalized here
/// to also report whether the row was already processed.
#[derive(Clone)]
pub struct SqliteInboxStore {
    pool: SqlitePool,
}

impl SqliteInboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> InboxRecord {
    InboxRecord {
        message_id: row.get("message_id"),
        source: row.get("source"),
        topic: row.get("topic"),
        payload: row.get("payload"),
        hash: row.get("hash"),
        first_seen_utc: sqltime::decode(row.get::<String, _>("first_seen_utc").as_str()),
        last_seen_utc: sqltime::decode(row.get::<String, _>("last_seen_utc").as_str()),
        processed_utc: sqltime::decode_opt(row.get("processed_utc")),
        attempts: row.get("attempts"),
        status: InboxStatus::parse(row.get::<String, _>("status").as_str()),
        owner_token: row
            .get::<Option<String>, _>("owner_token")
            .map(|s| Uuid::parse_str(&s).expect("corrupt inbox.owner_token")),
        locked_until: sqltime::decode_opt(row.get("locked_until")),
        due_time_utc: sqltime::decode_opt(row.get("due_time_utc")),
    }
}

#[async_trait]
impl InboxStore for SqliteInboxStore {
    async fn already_processed(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<bool> {
        validate_key(message_id, source)?;
        let now = sqltime::encode(clock.now());

        let row = sqlx::query(
            "INSERT INTO inbox (message_id, source, hash, first_seen_utc, last_seen_utc, attempts, status) \
             VALUES (?, ?, ?, ?, ?, 1, 'Seen') \
             ON CONFLICT (message_id, source) DO UPDATE SET \
                 last_seen_utc = excluded.last_seen_utc, attempts = inbox.attempts + 1 \
             RETURNING processed_utc",
        )
        .bind(message_id)
        .bind(source)
        .bind(hash)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        let processed: Option<String> = row.get(0);
        Ok(processed.is_some())
    }

    async fn enqueue(
        &self,
        message_id: &str,
        source: &str,
        topic: &str,
        payload: &str,
        hash: Option<&str>,
        due_time: Option<DateTime<Utc>>,
        clock: &dyn Clock,
    ) -> Result<()> {
        validate_key(message_id, source)?;
        let now = sqltime::encode(clock.now());
        let due = due_time.map(sqltime::encode);

        sqlx::query(
            "INSERT INTO inbox \
                 (message_id, source, topic, payload, hash, first_seen_utc, last_seen_utc, attempts, status, due_time_utc) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, 'Seen', ?) \
             ON CONFLICT (message_id, source) DO UPDATE SET \
                 last_seen_utc = excluded.last_seen_utc, attempts = inbox.attempts + 1",
        )
        .bind(message_id)
        .bind(source)
        .bind(topic)
        .bind(payload)
        .bind(hash)
        .bind(&now)
        .bind(&now)
        .bind(&due)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<InboxRecord>> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let rows = sqlx::query(
            "UPDATE inbox SET status = 'Processing', owner_token = ?, locked_until = ? \
             WHERE (message_id, source) IN ( \
                 SELECT message_id, source FROM inbox \
                 WHERE status = 'Seen' AND (due_time_utc IS NULL OR due_time_utc <= ?) \
                 ORDER BY due_time_utc ASC, rowid ASC LIMIT ? \
             ) RETURNING *",
        )
        .bind(owner.to_string())
        .bind(sqltime::encode(locked_until))
        .bind(sqltime::encode(now))
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn mark_processed(&self, owner: Uuid, message_id: &str, source: &str, clock: &dyn Clock) -> Result<()> {
        validate_key(message_id, source)?;
        sqlx::query(
            "UPDATE inbox SET status = 'Done', processed_utc = ? \
             WHERE message_id = ? AND source = ? AND owner_token = ?",
        )
        .bind(sqltime::encode(clock.now()))
        .bind(message_id)
        .bind(source)
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon(&self, owner: Uuid, message_id: &str, source: &str) -> Result<()> {
        validate_key(message_id, source)?;
        sqlx::query(
            "UPDATE inbox SET status = 'Seen', owner_token = NULL, locked_until = NULL \
             WHERE message_id = ? AND source = ? AND owner_token = ?",
        )
        .bind(message_id)
        .bind(source)
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, owner: Uuid, message_id: &str, source: &str) -> Result<()> {
        validate_key(message_id, source)?;
        sqlx::query(
            "UPDATE inbox SET status = 'Dead', owner_token = NULL, locked_until = NULL \
             WHERE message_id = ? AND source = ? AND owner_token = ?",
        )
        .bind(message_id)
        .bind(source)
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revive(&self, message_id: &str, source: &str) -> Result<()> {
        validate_key(message_id, source)?;
        sqlx::query("UPDATE inbox SET status = 'Seen' WHERE message_id = ? AND source = ? AND status = 'Dead'")
            .bind(message_id)
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reap_expired(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let result = sqlx::query(
            "UPDATE inbox SET status = 'Seen', owner_token = NULL, locked_until = NULL \
             WHERE (message_id, source) IN ( \
                 SELECT message_id, source FROM inbox \
                 WHERE status = 'Processing' AND locked_until <= ? \
                 ORDER BY locked_until ASC LIMIT ? \
             )",
        )
        .bind(sqltime::encode(now))
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, message_id: &str, source: &str) -> Result<Option<InboxRecord>> {
        let row = sqlx::query("SELECT * FROM inbox WHERE message_id = ? AND source = ?")
            .bind(message_id)
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{SystemClock, TestClock};

    async fn store() -> SqliteInboxStore {
        SqliteInboxStore::new(crate::storage::memory_pool().await)
    }

    #[tokio::test]
    async fn already_processed_is_false_on_first_sight_true_after_mark_processed() {
        let store = store().await;
        let clock = SystemClock;
        assert!(!store.already_processed("m1", "src", None, &clock).await.unwrap());

        let owner = Uuid::new_v4();
        store.claim_due(10, Duration::from_secs(30), owner, &clock).await.unwrap();
        store.mark_processed(owner, "m1", "src", &clock).await.unwrap();

        assert!(store.already_processed("m1", "src", None, &clock).await.unwrap());
    }

    #[tokio::test]
    async fn already_processed_bumps_attempts_on_repeat_sighting() {
        let store = store().await;
        let clock = SystemClock;
        store.already_processed("m1", "src", None, &clock).await.unwrap();
        store.already_processed("m1", "src", None, &clock).await.unwrap();
        let record = store.get("m1", "src").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn rejects_blank_message_id_and_source() {
        let store = store().await;
        let clock = SystemClock;
        assert!(store.already_processed("  ", "src", None, &clock).await.is_err());
        assert!(store.already_processed("m1", "", None, &clock).await.is_err());
    }

    #[tokio::test]
    async fn mark_dead_then_revive_round_trips() {
        let store = store().await;
        let clock = SystemClock;
        store.already_processed("m1", "src", None, &clock).await.unwrap();
        let owner = Uuid::new_v4();
        store.claim_due(10, Duration::from_secs(30), owner, &clock).await.unwrap();
        store.mark_dead(owner, "m1", "src").await.unwrap();

        let dead = store.get("m1", "src").await.unwrap().unwrap();
        assert_eq!(dead.status, InboxStatus::Dead);

        store.revive("m1", "src").await.unwrap();
        let revived = store.get("m1", "src").await.unwrap().unwrap();
        assert_eq!(revived.status, InboxStatus::Seen);
    }

    #[tokio::test]
    async fn reap_expired_restores_lapsed_claims() {
        let store = store().await;
        let clock = TestClock::new(Utc::now());
        store.already_processed("m1", "src", None, &clock).await.unwrap();
        store.claim_due(10, Duration::from_secs(1), Uuid::new_v4(), &clock).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.reap_expired(10, &clock).await.unwrap(), 1);
    }
}
