use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::outbox::store::validate_batch_size;
use crate::scheduler::cron;
use crate::scheduler::model::{Job, JobRun, RunStatus, Timer};
use crate::scheduler::store::SchedulerStore;
use crate::sqltime;
use crate::time::Clock;

/// SQLite-backed [`SchedulerStore`]. `CreateJobRunsFromDueJobs` runs inside
/// one transaction per batch, the same pattern as the teacher's
/// `create_message_and_increment_count`, so a crash mid-sweep never leaves a
/// job's `NextDueTime` advanced without its matching run inserted.
#[derive(Clone)]
pub struct SqliteSchedulerStore {
    pool: SqlitePool,
}

impl SqliteSchedulerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn persisted_fencing_token(&self) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT current_fencing_token FROM scheduler_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(t,)| t).unwrap_or(0))
    }

    async fn check_fencing(&self, fencing_token: i64) -> Result<()> {
        let persisted = self.persisted_fencing_token().await?;
        if fencing_token < persisted {
            return Err(PlatformError::LeaseLost { resource: "scheduler".to_string() });
        }
        Ok(())
    }
}

fn row_to_timer(row: &sqlx::sqlite::SqliteRow) -> Timer {
    Timer {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str()).expect("corrupt timers.id"),
        topic: row.get("topic"),
        payload: row.get("payload"),
        due_time: sqltime::decode(row.get::<String, _>("due_time").as_str()),
        status: RunStatus::parse(row.get::<String, _>("status").as_str()),
        owner_token: row
            .get::<Option<String>, _>("owner_token")
            .map(|s| Uuid::parse_str(&s).expect("corrupt timers.owner_token")),
        locked_until: sqltime::decode_opt(row.get("locked_until")),
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    Job {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str()).expect("corrupt jobs.id"),
        name: row.get("name"),
        topic: row.get("topic"),
        payload: row.get("payload"),
        cron_schedule: row.get("cron_schedule"),
        next_due_time: sqltime::decode(row.get::<String, _>("next_due_time").as_str()),
    }
}

#[async_trait]
impl SchedulerStore for SqliteSchedulerStore {
    async fn schedule_timer(&self, topic: &str, payload: &str, due_time: DateTime<Utc>, _clock: &dyn Clock) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO timers (id, topic, payload, due_time, status) VALUES (?, ?, ?, ?, 'Pending')")
            .bind(id.to_string())
            .bind(topic)
            .bind(payload)
            .bind(sqltime::encode(due_time))
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn cancel_timer(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM timers WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_or_update_job(
        &self,
        name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<Uuid> {
        // Inclusive of `now`: a schedule due immediately must be picked up
        // by the very next `create_job_runs_from_due_jobs` sweep (spec §8
        // scenario S5), not skipped to its following occurrence.
        let next_due = cron::next_at_or_after(cron_schedule, clock.now())?;
        let candidate_id = Uuid::new_v4();

        let row = sqlx::query(
            "INSERT INTO jobs (id, name, topic, payload, cron_schedule, next_due_time) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET \
                 topic = excluded.topic, payload = excluded.payload, \
                 cron_schedule = excluded.cron_schedule, next_due_time = excluded.next_due_time \
             RETURNING id",
        )
        .bind(candidate_id.to_string())
        .bind(name)
        .bind(topic)
        .bind(payload.unwrap_or(""))
        .bind(cron_schedule)
        .bind(sqltime::encode(next_due))
        .fetch_one(&self.pool)
        .await?;

        let id: String = row.get(0);
        Ok(Uuid::parse_str(&id).expect("corrupt jobs.id"))
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE name = ?").bind(name).execute(&self.pool).await?;
        Ok(())
    }

    async fn trigger_job(&self, name: &str, clock: &dyn Clock) -> Result<Uuid> {
        let job = sqlx::query("SELECT id FROM jobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PlatformError::invalid(format!("unknown job {name:?}")))?;
        let job_id: String = job.get(0);

        let run_id = Uuid::new_v4();
        sqlx::query("INSERT INTO job_runs (id, job_id, scheduled_time, status) VALUES (?, ?, ?, 'Pending')")
            .bind(run_id.to_string())
            .bind(job_id)
            .bind(sqltime::encode(clock.now()))
            .execute(&self.pool)
            .await?;
        Ok(run_id)
    }

    async fn create_job_runs_from_due_jobs(&self, clock: &dyn Clock) -> Result<u64> {
        let now = clock.now();
        let due: Vec<(String, String)> = sqlx::query_as("SELECT id, cron_schedule FROM jobs WHERE next_due_time <= ?")
            .bind(sqltime::encode(now))
            .fetch_all(&self.pool)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut created = 0u64;
        for (job_id, cron_schedule) in due {
            let next_due = cron::next_after(&cron_schedule, now)?;
            sqlx::query("INSERT INTO job_runs (id, job_id, scheduled_time, status) VALUES (?, ?, ?, 'Pending')")
                .bind(Uuid::new_v4().to_string())
                .bind(&job_id)
                .bind(sqltime::encode(now))
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE jobs SET next_due_time = ? WHERE id = ?")
                .bind(sqltime::encode(next_due))
                .bind(&job_id)
                .execute(&mut *tx)
                .await?;
            created += 1;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn update_scheduler_state(&self, fencing_token: i64, clock: &dyn Clock) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduler_state (id, current_fencing_token, last_run_at) VALUES (1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
                 current_fencing_token = excluded.current_fencing_token, last_run_at = excluded.last_run_at \
             WHERE excluded.current_fencing_token >= scheduler_state.current_fencing_token",
        )
        .bind(fencing_token)
        .bind(sqltime::encode(clock.now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due_timers(
        &self,
        fencing_token: i64,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<Timer>> {
        validate_batch_size(batch_size)?;
        self.check_fencing(fencing_token).await?;
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let rows = sqlx::query(
            "UPDATE timers SET status = 'Claimed', owner_token = ?, locked_until = ? \
             WHERE id IN ( \
                 SELECT id FROM timers WHERE status = 'Pending' AND due_time <= ? \
                 ORDER BY due_time ASC, rowid ASC LIMIT ? \
             ) RETURNING *",
        )
        .bind(owner.to_string())
        .bind(sqltime::encode(locked_until))
        .bind(sqltime::encode(now))
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_timer).collect())
    }

    async fn claim_due_job_runs(
        &self,
        fencing_token: i64,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<JobRun>> {
        validate_batch_size(batch_size)?;
        self.check_fencing(fencing_token).await?;
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let rows = sqlx::query(
            "UPDATE job_runs SET status = 'Claimed', owner_token = ?, locked_until = ? \
             WHERE id IN ( \
                 SELECT id FROM job_runs WHERE status = 'Pending' AND scheduled_time <= ? \
                 ORDER BY scheduled_time ASC, rowid ASC LIMIT ? \
             ) RETURNING *",
        )
        .bind(owner.to_string())
        .bind(sqltime::encode(locked_until))
        .bind(sqltime::encode(now))
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let job_ids: Vec<String> = rows.iter().map(|r| r.get::<String, _>("job_id")).collect();
        let placeholders = job_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT id, topic, payload FROM jobs WHERE id IN ({placeholders})");
        let mut q = sqlx::query(&sql);
        for id in &job_ids {
            q = q.bind(id);
        }
        let job_rows = q.fetch_all(&self.pool).await?;
        let jobs: HashMap<String, (String, String)> = job_rows
            .iter()
            .map(|r| (r.get::<String, _>("id"), (r.get::<String, _>("topic"), r.get::<String, _>("payload"))))
            .collect();

        Ok(rows
            .iter()
            .map(|row| {
                let job_id: String = row.get("job_id");
                let (topic, payload) = jobs.get(&job_id).cloned().unwrap_or_default();
                JobRun {
                    id: Uuid::parse_str(row.get::<String, _>("id").as_str()).expect("corrupt job_runs.id"),
                    job_id: Uuid::parse_str(&job_id).expect("corrupt job_runs.job_id"),
                    scheduled_time: sqltime::decode(row.get::<String, _>("scheduled_time").as_str()),
                    status: RunStatus::parse(row.get::<String, _>("status").as_str()),
                    owner_token: row
                        .get::<Option<String>, _>("owner_token")
                        .map(|s| Uuid::parse_str(&s).expect("corrupt job_runs.owner_token")),
                    locked_until: sqltime::decode_opt(row.get("locked_until")),
                    topic,
                    payload,
                }
            })
            .collect())
    }

    async fn ack_timer(&self, owner: Uuid, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE timers SET status = 'Acknowledged' WHERE id = ? AND owner_token = ?")
            .bind(id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon_timer(&self, owner: Uuid, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE timers SET status = 'Pending', owner_token = NULL, locked_until = NULL WHERE id = ? AND owner_token = ?")
            .bind(id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ack_job_run(&self, owner: Uuid, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE job_runs SET status = 'Acknowledged' WHERE id = ? AND owner_token = ?")
            .bind(id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon_job_run(&self, owner: Uuid, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE job_runs SET status = 'Pending', owner_token = NULL, locked_until = NULL WHERE id = ? AND owner_token = ?",
        )
        .bind(id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_expired_timers(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let result = sqlx::query(
            "UPDATE timers SET status = 'Pending', owner_token = NULL, locked_until = NULL \
             WHERE id IN (SELECT id FROM timers WHERE status = 'Claimed' AND locked_until <= ? ORDER BY locked_until ASC LIMIT ?)",
        )
        .bind(sqltime::encode(clock.now()))
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reap_expired_job_runs(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let result = sqlx::query(
            "UPDATE job_runs SET status = 'Pending', owner_token = NULL, locked_until = NULL \
             WHERE id IN (SELECT id FROM job_runs WHERE status = 'Claimed' AND locked_until <= ? ORDER BY locked_until ASC LIMIT ?)",
        )
        .bind(sqltime::encode(clock.now()))
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_next_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT MIN(t) FROM ( \
                 SELECT MIN(due_time) AS t FROM timers WHERE status = 'Pending' \
                 UNION ALL SELECT MIN(scheduled_time) FROM job_runs WHERE status = 'Pending' \
                 UNION ALL SELECT MIN(next_due_time) FROM jobs \
             )",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(t,)| t).map(|s| sqltime::decode(&s)))
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE name = ?").bind(name).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(row_to_job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{SystemClock, TestClock};

    async fn store() -> SqliteSchedulerStore {
        SqliteSchedulerStore::new(crate::storage::memory_pool().await)
    }

    #[tokio::test]
    async fn timer_round_trips_through_claim_ack() {
        let store = store().await;
        let clock = SystemClock;
        let id = store.schedule_timer("t", "p", clock.now(), &clock).await.unwrap();
        let owner = Uuid::new_v4();
        let claimed = store.claim_due_timers(0, 10, Duration::from_secs(30), owner, &clock).await.unwrap();
        assert_eq!(claimed[0].id, id);
        store.ack_timer(owner, id).await.unwrap();
        assert!(store.claim_due_timers(0, 10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_rejects_stale_fencing_token() {
        let store = store().await;
        let clock = SystemClock;
        store.update_scheduler_state(5, &clock).await.unwrap();
        let err = store.claim_due_timers(4, 10, Duration::from_secs(30), Uuid::new_v4(), &clock).await;
        assert!(err.is_err());
    }

    // Scenario S5 — cron materialisation.
    #[tokio::test]
    async fn s5_create_job_runs_advances_next_due_time_strictly_forward() {
        let store = store().await;
        let t: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let clock = TestClock::new(t);
        store.create_or_update_job("job-n", "topic", "*/5 * * * *", None, &clock).await.unwrap();

        clock.advance(Duration::from_secs(1));
        let created = store.create_job_runs_from_due_jobs(&clock).await.unwrap();
        assert_eq!(created, 1);

        let job = store.get_job("job-n").await.unwrap().unwrap();
        assert!(job.next_due_time > t + chrono::Duration::seconds(1));
        assert_eq!(job.next_due_time, "2026-01-01T00:05:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn delete_job_removes_pending_runs() {
        let store = store().await;
        let clock = SystemClock;
        store.create_or_update_job("job-n", "topic", "*/5 * * * *", None, &clock).await.unwrap();
        let run_id = store.trigger_job("job-n", &clock).await.unwrap();
        store.delete_job("job-n").await.unwrap();

        let owner = Uuid::new_v4();
        let claimed = store.claim_due_job_runs(0, 10, Duration::from_secs(30), owner, &clock).await.unwrap();
        assert!(claimed.iter().all(|r| r.id != run_id));
    }
}
