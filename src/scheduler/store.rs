use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::model::{Job, JobRun, Timer};
use crate::time::Clock;

/// Cron-driven jobs plus one-shot timers, materialized into claimable runs
/// (spec §4.4).
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn schedule_timer(&self, topic: &str, payload: &str, due_time: DateTime<Utc>, clock: &dyn Clock) -> Result<Uuid>;
    async fn cancel_timer(&self, id: Uuid) -> Result<()>;

    /// Upsert by `name`. A cron expression that fails to parse is an
    /// `InvalidArgument`. `NextDueTime` is (re)computed from `clock.now()`
    /// on every call, including updates — see DESIGN.md for why.
    async fn create_or_update_job(
        &self,
        name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<Uuid>;

    /// Removes the job and all of its Pending runs.
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// Immediately materializes a claimable run for `name`, independent of
    /// its cron schedule.
    async fn trigger_job(&self, name: &str, clock: &dyn Clock) -> Result<Uuid>;

    /// For every job with `NextDueTime <= now`, inserts a Pending run at
    /// `now` and advances `NextDueTime` to the next occurrence strictly
    /// after `now`. Returns the number of runs created.
    async fn create_job_runs_from_due_jobs(&self, clock: &dyn Clock) -> Result<u64>;

    /// Stamps the fencing token a dispatcher's lease currently carries, so
    /// subsequent claims can be gated against it (spec §9 open question).
    async fn update_scheduler_state(&self, fencing_token: i64, clock: &dyn Clock) -> Result<()>;

    /// Requires `fencing_token >= persisted token`; fails with `LeaseLost`
    /// otherwise (the caller's lease has been superseded).
    async fn claim_due_timers(
        &self,
        fencing_token: i64,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<Timer>>;

    async fn claim_due_job_runs(
        &self,
        fencing_token: i64,
        batch_size: u32,
        lease_duration: Duration,
        owner: Uuid,
        clock: &dyn Clock,
    ) -> Result<Vec<JobRun>>;

    async fn ack_timer(&self, owner: Uuid, id: Uuid) -> Result<()>;
    async fn abandon_timer(&self, owner: Uuid, id: Uuid) -> Result<()>;
    async fn ack_job_run(&self, owner: Uuid, id: Uuid) -> Result<()>;
    async fn abandon_job_run(&self, owner: Uuid, id: Uuid) -> Result<()>;

    async fn reap_expired_timers(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64>;
    async fn reap_expired_job_runs(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64>;

    /// Min of the earliest pending timer, earliest pending run, and
    /// earliest job `NextDueTime`. Paces the dispatcher's poll interval.
    async fn get_next_event_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn get_job(&self, name: &str) -> Result<Option<Job>>;
}
