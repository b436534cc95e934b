//! Background retention sweep: deletes terminal rows older than
//! `PlatformConfig::retention`, and returns lapsed claims to their claimable
//! state (spec §3 "Lifecycles ... removed by a background retention
//! policy").
//!
//! Grounded on the teacher's `telemetry::retention::prune_traces`: compute a
//! cutoff from "now minus retention", iterate, delete, count, log — and on
//! `Storage::prune_old_sessions`/`vacuum` for doing this against SQL tables
//! rather than files.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::providers::DatabaseStores;
use crate::sqltime;
use crate::time::Clock;

/// How many rows were deleted/reaped in one [`RetentionSweeper::run_once`]
/// pass, broken down by table — mirrors `prune_traces`'s returned count but
/// one per subsystem instead of a single total.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionReport {
    pub outbox_deleted: u64,
    pub outbox_joins_deleted: u64,
    pub inbox_deleted: u64,
    pub job_runs_deleted: u64,
    pub timers_deleted: u64,
    pub external_effects_deleted: u64,
    pub outbox_reaped: u64,
    pub inbox_reaped: u64,
    pub timers_reaped: u64,
    pub job_runs_reaped: u64,
}

pub struct RetentionSweeper {
    stores: Arc<DatabaseStores>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    reap_batch_size: u32,
    last_run_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl RetentionSweeper {
    pub fn new(stores: Arc<DatabaseStores>, clock: Arc<dyn Clock>, retention: Duration, reap_batch_size: u32) -> Self {
        Self { stores, clock, retention, reap_batch_size, last_run_at: Arc::new(Mutex::new(None)) }
    }

    /// A handle [`crate::diagnostics`] can read without holding a reference
    /// to the whole sweeper.
    pub fn last_run_handle(&self) -> Arc<Mutex<Option<DateTime<Utc>>>> {
        self.last_run_at.clone()
    }

    pub async fn run_once(&self) -> anyhow::Result<RetentionReport> {
        let now = self.clock.now();
        let cutoff = sqltime::encode(now - chrono::Duration::from_std(self.retention)?);
        let mut report = RetentionReport::default();

        report.outbox_reaped = self.stores.outbox.reap_expired(self.reap_batch_size, self.clock.as_ref()).await?;
        report.inbox_reaped = self.stores.inbox.reap_expired(self.reap_batch_size, self.clock.as_ref()).await?;
        report.timers_reaped =
            self.stores.scheduler.reap_expired_timers(self.reap_batch_size, self.clock.as_ref()).await?;
        report.job_runs_reaped =
            self.stores.scheduler.reap_expired_job_runs(self.reap_batch_size, self.clock.as_ref()).await?;

        report.outbox_deleted = sqlx::query(
            "DELETE FROM outbox WHERE status IN ('Acknowledged', 'Failed') AND due_time_utc < ?",
        )
        .bind(&cutoff)
        .execute(&self.stores.pool)
        .await?
        .rows_affected();

        report.outbox_joins_deleted = sqlx::query(
            "DELETE FROM outbox_joins WHERE status != 'Pending' AND last_updated_utc < ?",
        )
        .bind(&cutoff)
        .execute(&self.stores.pool)
        .await?
        .rows_affected();

        report.inbox_deleted = sqlx::query(
            "DELETE FROM inbox WHERE status IN ('Done', 'Dead') AND last_seen_utc < ?",
        )
        .bind(&cutoff)
        .execute(&self.stores.pool)
        .await?
        .rows_affected();

        report.job_runs_deleted = sqlx::query(
            "DELETE FROM job_runs WHERE status IN ('Acknowledged', 'Abandoned') AND scheduled_time < ?",
        )
        .bind(&cutoff)
        .execute(&self.stores.pool)
        .await?
        .rows_affected();

        report.timers_deleted = sqlx::query(
            "DELETE FROM timers WHERE status IN ('Acknowledged', 'Abandoned') AND due_time < ?",
        )
        .bind(&cutoff)
        .execute(&self.stores.pool)
        .await?
        .rows_affected();

        report.external_effects_deleted = sqlx::query(
            "DELETE FROM external_side_effects WHERE status IN ('Succeeded', 'Failed') AND last_updated_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.stores.pool)
        .await?
        .rows_affected();

        *self.last_run_at.lock().await = Some(now);
        info!(
            outbox = report.outbox_deleted,
            inbox = report.inbox_deleted,
            job_runs = report.job_runs_deleted,
            timers = report.timers_deleted,
            external_effects = report.external_effects_deleted,
            "retention sweep complete"
        );
        Ok(report)
    }

    pub fn spawn_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(%err, "retention sweep failed");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn deletes_old_acknowledged_outbox_rows_but_keeps_recent_ones() {
        let pool = crate::storage::memory_pool().await;
        let stores = Arc::new(DatabaseStores::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let old_id = stores.outbox.enqueue("t", "{}", None, None, clock.as_ref()).await.unwrap();
        let recent_id = stores.outbox.enqueue("t", "{}", None, None, clock.as_ref()).await.unwrap();
        let owner = uuid::Uuid::new_v4();
        stores.outbox.claim_due(10, Duration::from_secs(30), owner, clock.as_ref()).await.unwrap();
        stores.outbox.mark_dispatched(owner, old_id, clock.as_ref()).await.unwrap();
        stores.outbox.mark_dispatched(owner, recent_id, clock.as_ref()).await.unwrap();

        // Backdate only the old row so the cutoff catches it but not the
        // recent one.
        sqlx::query("UPDATE outbox SET due_time_utc = ? WHERE id = ?")
            .bind(sqltime::encode(clock.now() - chrono::Duration::days(10)))
            .bind(old_id.to_string())
            .execute(&stores.pool)
            .await
            .unwrap();

        let sweeper = RetentionSweeper::new(stores.clone(), clock, Duration::from_secs(3600), 100);
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.outbox_deleted, 1);
        assert!(stores.outbox.get(old_id).await.unwrap().is_none());
        assert!(stores.outbox.get(recent_id).await.unwrap().is_some());
    }
}
