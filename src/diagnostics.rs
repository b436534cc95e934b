//! Read-only platform status: current lease holders, per-table queue
//! depths, and the last retention sweep time. No write surface.
//!
//! Grounded on the teacher's `health::reporter::HealthReporter`: assemble a
//! single status struct by querying each subsystem, rather than exposing
//! each subsystem's internals directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::providers::DatabaseStores;
use crate::sqltime;

#[derive(Debug, Clone, Serialize)]
pub struct LeaseSummary {
    pub resource: String,
    pub owner_token: Option<String>,
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepths {
    pub outbox_ready: i64,
    pub outbox_in_progress: i64,
    pub outbox_failed: i64,
    pub inbox_seen: i64,
    pub inbox_processing: i64,
    pub inbox_dead: i64,
    pub pending_timers: i64,
    pub pending_job_runs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformSnapshot {
    pub leases: Vec<LeaseSummary>,
    pub queue_depths: QueueDepths,
    pub last_retention_sweep_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

/// Assembles a [`PlatformSnapshot`] for one logical database. `last_reap`
/// is typically [`crate::retention::RetentionSweeper::last_run_handle`];
/// pass `None` if no sweeper is running.
pub async fn snapshot(
    stores: &DatabaseStores,
    last_reap: Option<&Arc<Mutex<Option<DateTime<Utc>>>>>,
    now: DateTime<Utc>,
) -> anyhow::Result<PlatformSnapshot> {
    let lease_rows: Vec<(String, Option<String>, i64, String)> =
        sqlx::query_as("SELECT key, owner_token, fencing_token, expires_at FROM system_leases WHERE expires_at > ?")
            .bind(sqltime::encode(now))
            .fetch_all(&stores.pool)
            .await?;
    let leases = lease_rows
        .into_iter()
        .map(|(resource, owner_token, fencing_token, expires_at)| LeaseSummary {
            resource,
            owner_token,
            fencing_token,
            expires_at: sqltime::decode(&expires_at),
        })
        .collect();

    let queue_depths = QueueDepths {
        outbox_ready: count(&stores.pool, "SELECT COUNT(*) FROM outbox WHERE status = 'Ready'").await?,
        outbox_in_progress: count(&stores.pool, "SELECT COUNT(*) FROM outbox WHERE status = 'InProgress'").await?,
        outbox_failed: count(&stores.pool, "SELECT COUNT(*) FROM outbox WHERE status = 'Failed'").await?,
        inbox_seen: count(&stores.pool, "SELECT COUNT(*) FROM inbox WHERE status = 'Seen'").await?,
        inbox_processing: count(&stores.pool, "SELECT COUNT(*) FROM inbox WHERE status = 'Processing'").await?,
        inbox_dead: count(&stores.pool, "SELECT COUNT(*) FROM inbox WHERE status = 'Dead'").await?,
        pending_timers: count(&stores.pool, "SELECT COUNT(*) FROM timers WHERE status = 'Pending'").await?,
        pending_job_runs: count(&stores.pool, "SELECT COUNT(*) FROM job_runs WHERE status = 'Pending'").await?,
    };

    let last_retention_sweep_at = match last_reap {
        Some(handle) => *handle.lock().await,
        None => None,
    };

    Ok(PlatformSnapshot { leases, queue_depths, last_retention_sweep_at, generated_at: now })
}

async fn count(pool: &sqlx::SqlitePool, sql: &str) -> anyhow::Result<i64> {
    let (n,): (i64,) = sqlx::query_as(sql).fetch_one(pool).await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, SystemClock};

    #[tokio::test]
    async fn reports_queue_depths_and_active_leases() {
        let pool = crate::storage::memory_pool().await;
        let stores = DatabaseStores::new(pool);
        let clock = SystemClock;

        stores.outbox.enqueue("t", "{}", None, None, &clock).await.unwrap();
        stores
            .lease
            .acquire("scheduler", None, std::time::Duration::from_secs(30), &clock)
            .await
            .unwrap();

        let snap = snapshot(&stores, None, clock.now()).await.unwrap();
        assert_eq!(snap.queue_depths.outbox_ready, 1);
        assert_eq!(snap.leases.len(), 1);
        assert_eq!(snap.leases[0].resource, "scheduler");
    }
}
