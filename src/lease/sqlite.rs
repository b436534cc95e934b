use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::lease::model::Lease;
use crate::lease::store::LeaseStore;
use crate::time::Clock;

/// SQLite-backed [`LeaseStore`]. Acquire/renew are both single atomic
/// `UPDATE ... WHERE ... RETURNING` statements — the same compare-and-set
/// idiom the teacher uses for `claim_session_for_run`/`claim_task`, rather
/// than an explicit transaction, since SQLite serializes writers anyway.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn acquire(
        &self,
        resource: &str,
        owner_token: Option<Uuid>,
        duration: Duration,
        clock: &dyn Clock,
    ) -> Result<Option<Lease>> {
        let now = clock.now();
        let new_owner = owner_token.unwrap_or_else(Uuid::new_v4);
        let expires_at = now + chrono::Duration::from_std(duration).unwrap_or_default();

        // Case (b)/(c): the row is expired, or the caller already owns it.
        let renewed = sqlx::query(
            "UPDATE system_leases SET owner_token = ?, fencing_token = fencing_token + 1, expires_at = ? \
             WHERE key = ? AND (expires_at <= ? OR owner_token = ?) \
             RETURNING fencing_token",
        )
        .bind(new_owner.to_string())
        .bind(expires_at.to_rfc3339())
        .bind(resource)
        .bind(now.to_rfc3339())
        .bind(new_owner.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = renewed {
            let fencing_token: i64 = row.get(0);
            return Ok(Some(Lease::new(resource.to_string(), new_owner, fencing_token, expires_at)));
        }

        // Case (a): no row exists yet.
        let inserted = sqlx::query(
            "INSERT INTO system_leases (key, owner_token, fencing_token, expires_at) \
             SELECT ?, ?, 1, ? WHERE NOT EXISTS (SELECT 1 FROM system_leases WHERE key = ?)",
        )
        .bind(resource)
        .bind(new_owner.to_string())
        .bind(expires_at.to_rfc3339())
        .bind(resource)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(Some(Lease::new(resource.to_string(), new_owner, 1, expires_at)));
        }

        // A different owner holds an unexpired lease.
        Ok(None)
    }

    async fn try_renew_now(&self, lease: &mut Lease, duration: Duration, clock: &dyn Clock) -> Result<bool> {
        let now = clock.now();
        let expires_at = now + chrono::Duration::from_std(duration).unwrap_or_default();

        let renewed = sqlx::query(
            "UPDATE system_leases SET fencing_token = fencing_token + 1, expires_at = ? \
             WHERE key = ? AND owner_token = ? AND fencing_token = ? AND expires_at > ? \
             RETURNING fencing_token",
        )
        .bind(expires_at.to_rfc3339())
        .bind(&lease.resource)
        .bind(lease.owner_token.to_string())
        .bind(lease.fencing_token)
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        match renewed {
            Some(row) => {
                lease.fencing_token = row.get(0);
                lease.expires_at = expires_at;
                Ok(true)
            }
            None => {
                lease.mark_lost();
                Ok(false)
            }
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        sqlx::query("DELETE FROM system_leases WHERE key = ? AND owner_token = ? AND fencing_token = ?")
            .bind(&lease.resource)
            .bind(lease.owner_token.to_string())
            .bind(lease.fencing_token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current_fencing_token(&self, resource: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT fencing_token FROM system_leases WHERE key = ?")
            .bind(resource)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(f,)| f).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::store::throw_if_lost;
    use crate::time::{SystemClock, TestClock};

    async fn store() -> SqliteLeaseStore {
        SqliteLeaseStore::new(crate::storage::memory_pool().await)
    }

    // Scenario S4 — lease fencing.
    #[tokio::test]
    async fn s4_fencing_tokens_strictly_increase_across_owners() {
        let store = store().await;
        let clock = TestClock::new(chrono::Utc::now());

        let lease1 = store
            .acquire("k", None, Duration::from_secs(10), &clock)
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert_eq!(lease1.fencing_token, 1);

        clock.advance(Duration::from_secs(11));

        let lease2 = store
            .acquire("k", None, Duration::from_secs(10), &clock)
            .await
            .unwrap()
            .expect("second acquire succeeds after expiry");
        assert!(lease2.fencing_token > lease1.fencing_token);
    }

    #[tokio::test]
    async fn different_owner_cannot_acquire_unexpired_lease() {
        let store = store().await;
        let clock = SystemClock;
        let _held = store
            .acquire("k", None, Duration::from_secs(30), &clock)
            .await
            .unwrap()
            .unwrap();

        let attempt = store.acquire("k", None, Duration::from_secs(30), &clock).await.unwrap();
        assert!(attempt.is_none());
    }

    #[tokio::test]
    async fn renew_fails_once_lease_is_lost_to_another_owner() {
        let store = store().await;
        let clock = TestClock::new(chrono::Utc::now());
        let mut lease = store
            .acquire("k", None, Duration::from_secs(1), &clock)
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(2));
        // Someone else takes over the now-expired lease.
        let _other = store.acquire("k", None, Duration::from_secs(30), &clock).await.unwrap().unwrap();

        let ok = store.try_renew_now(&mut lease, Duration::from_secs(30), &clock).await.unwrap();
        assert!(!ok);
        assert!(throw_if_lost(&lease, &clock).is_err());
    }

    #[tokio::test]
    async fn renew_fails_once_owned_lease_has_expired_but_not_been_reacquired() {
        let store = store().await;
        let clock = TestClock::new(chrono::Utc::now());
        let mut lease = store
            .acquire("k", None, Duration::from_secs(1), &clock)
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(2));
        let ok = store.try_renew_now(&mut lease, Duration::from_secs(30), &clock).await.unwrap();
        assert!(!ok);
        assert!(throw_if_lost(&lease, &clock).is_err());
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let store = store().await;
        let clock = SystemClock;
        let lease = store
            .acquire("k", None, Duration::from_secs(30), &clock)
            .await
            .unwrap()
            .unwrap();
        store.release(&lease).await.unwrap();

        let again = store.acquire("k", None, Duration::from_secs(30), &clock).await.unwrap();
        assert!(again.is_some());
    }
}
