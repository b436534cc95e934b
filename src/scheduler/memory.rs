use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::outbox::store::validate_batch_size;
use crate::scheduler::cron;
use crate::scheduler::model::{Job, JobRun, RunStatus, Timer};
use crate::scheduler::store::SchedulerStore;
use crate::time::Clock;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    jobs_by_name: HashMap<String, Uuid>,
    job_runs: HashMap<Uuid, JobRun>,
    timers: HashMap<Uuid, Timer>,
    fencing_token: i64,
}

/// In-memory [`SchedulerStore`] conformance reference.
#[derive(Default)]
pub struct InMemorySchedulerStore {
    state: Mutex<State>,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn schedule_timer(&self, topic: &str, payload: &str, due_time: DateTime<Utc>, _clock: &dyn Clock) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let timer = Timer {
            id,
            topic: topic.to_string(),
            payload: payload.to_string(),
            due_time,
            status: RunStatus::Pending,
            owner_token: None,
            locked_until: None,
        };
        self.state.lock().unwrap().timers.insert(id, timer);
        Ok(id)
    }

    async fn cancel_timer(&self, id: Uuid) -> Result<()> {
        self.state.lock().unwrap().timers.remove(&id);
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
        // Inclusive of `now` — see the sqlite store for why.
        let next_due = cron::next_at_or_after(cron_schedule, clock.now())?;
        let mut state = self.state.lock().unwrap();
        let id = state.jobs_by_name.get(name).copied().unwrap_or_else(Uuid::new_v4);
        state.jobs_by_name.insert(name.to_string(), id);
        state.jobs.insert(
            id,
            Job {
                id,
                name: name.to_string(),
                topic: topic.to_string(),
                payload: payload.unwrap_or("").to_string(),
                cron_schedule: cron_schedule.to_string(),
                next_due_time: next_due,
            },
        );
        Ok(id)
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.jobs_by_name.remove(name) {
            state.jobs.remove(&id);
            state.job_runs.retain(|_, r| r.job_id != id);
        }
        Ok(())
    }

    async fn trigger_job(&self, name: &str, clock: &dyn Clock) -> Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        let job_id = *state
            .jobs_by_name
            .get(name)
            .ok_or_else(|| PlatformError::invalid(format!("unknown job {name:?}")))?;
        let job = state.jobs[&job_id].clone();
        let run_id = Uuid::new_v4();
        state.job_runs.insert(
            run_id,
            JobRun {
                id: run_id,
                job_id,
                scheduled_time: clock.now(),
                status: RunStatus::Pending,
                owner_token: None,
                locked_until: None,
                topic: job.topic,
                payload: job.payload,
            },
        );
        Ok(run_id)
    }

    async fn create_job_runs_from_due_jobs(&self, clock: &dyn Clock) -> Result<u64> {
        let now = clock.now();
        let mut state = self.state.lock().unwrap();
        let due: Vec<Uuid> = state.jobs.values().filter(|j| j.next_due_time <= now).map(|j| j.id).collect();

        let mut created = 0u64;
        for job_id in due {
            let (topic, payload, cron_schedule) = {
                let job = &state.jobs[&job_id];
                (job.topic.clone(), job.payload.clone(), job.cron_schedule.clone())
            };
            let next_due = cron::next_after(&cron_schedule, now)?;
            let run_id = Uuid::new_v4();
            state.job_runs.insert(
                run_id,
                JobRun {
                    id: run_id,
                    job_id,
                    scheduled_time: now,
                    status: RunStatus::Pending,
                    owner_token: None,
                    locked_until: None,
                    topic,
                    payload,
                },
            );
            state.jobs.get_mut(&job_id).unwrap().next_due_time = next_due;
            created += 1;
        }
        Ok(created)
    }

    async fn update_scheduler_state(&self, fencing_token: i64, _clock: &dyn Clock) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if fencing_token >= state.fencing_token {
            state.fencing_token = fencing_token;
        }
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
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if fencing_token < state.fencing_token {
            return Err(PlatformError::LeaseLost { resource: "scheduler".to_string() });
        }

        let mut candidates: Vec<Uuid> = state
            .timers
            .values()
            .filter(|t| t.status == RunStatus::Pending && t.due_time <= now)
            .map(|t| t.id)
            .collect();
        candidates.sort_by_key(|id| state.timers[id].due_time);
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let t = state.timers.get_mut(&id).unwrap();
            t.status = RunStatus::Claimed;
            t.owner_token = Some(owner);
            t.locked_until = Some(locked_until);
            claimed.push(t.clone());
        }
        Ok(claimed)
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
        let now = clock.now();
        let locked_until = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if fencing_token < state.fencing_token {
            return Err(PlatformError::LeaseLost { resource: "scheduler".to_string() });
        }

        let mut candidates: Vec<Uuid> = state
            .job_runs
            .values()
            .filter(|r| r.status == RunStatus::Pending && r.scheduled_time <= now)
            .map(|r| r.id)
            .collect();
        candidates.sort_by_key(|id| state.job_runs[id].scheduled_time);
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let r = state.job_runs.get_mut(&id).unwrap();
            r.status = RunStatus::Claimed;
            r.owner_token = Some(owner);
            r.locked_until = Some(locked_until);
            claimed.push(r.clone());
        }
        Ok(claimed)
    }

    async fn ack_timer(&self, owner: Uuid, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.timers.get_mut(&id) {
            if t.owner_token == Some(owner) {
                t.status = RunStatus::Acknowledged;
            }
        }
        Ok(())
    }

    async fn abandon_timer(&self, owner: Uuid, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.timers.get_mut(&id) {
            if t.owner_token == Some(owner) {
                t.status = RunStatus::Pending;
                t.owner_token = None;
                t.locked_until = None;
            }
        }
        Ok(())
    }

    async fn ack_job_run(&self, owner: Uuid, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(r) = state.job_runs.get_mut(&id) {
            if r.owner_token == Some(owner) {
                r.status = RunStatus::Acknowledged;
            }
        }
        Ok(())
    }

    async fn abandon_job_run(&self, owner: Uuid, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(r) = state.job_runs.get_mut(&id) {
            if r.owner_token == Some(owner) {
                r.status = RunStatus::Pending;
                r.owner_token = None;
                r.locked_until = None;
            }
        }
        Ok(())
    }

    async fn reap_expired_timers(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let mut state = self.state.lock().unwrap();
        let mut expired: Vec<Uuid> = state
            .timers
            .values()
            .filter(|t| t.status == RunStatus::Claimed && t.locked_until.map(|l| l <= now).unwrap_or(false))
            .map(|t| t.id)
            .collect();
        expired.truncate(batch_size as usize);
        for id in &expired {
            let t = state.timers.get_mut(id).unwrap();
            t.status = RunStatus::Pending;
            t.owner_token = None;
            t.locked_until = None;
        }
        Ok(expired.len() as u64)
    }

    async fn reap_expired_job_runs(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let mut state = self.state.lock().unwrap();
        let mut expired: Vec<Uuid> = state
            .job_runs
            .values()
            .filter(|r| r.status == RunStatus::Claimed && r.locked_until.map(|l| l <= now).unwrap_or(false))
            .map(|r| r.id)
            .collect();
        expired.truncate(batch_size as usize);
        for id in &expired {
            let r = state.job_runs.get_mut(id).unwrap();
            r.status = RunStatus::Pending;
            r.owner_token = None;
            r.locked_until = None;
        }
        Ok(expired.len() as u64)
    }

    async fn get_next_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        let earliest_timer = state.timers.values().filter(|t| t.status == RunStatus::Pending).map(|t| t.due_time).min();
        let earliest_run = state.job_runs.values().filter(|r| r.status == RunStatus::Pending).map(|r| r.scheduled_time).min();
        let earliest_job = state.jobs.values().map(|j| j.next_due_time).min();
        Ok([earliest_timer, earliest_run, earliest_job].into_iter().flatten().min())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs_by_name.get(name).and_then(|id| state.jobs.get(id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn matches_sqlite_claim_and_fencing_contract() {
        let store = InMemorySchedulerStore::new();
        let clock = SystemClock;
        store.update_scheduler_state(5, &clock).await.unwrap();
        assert!(store.claim_due_timers(4, 10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.is_err());

        let id = store.schedule_timer("t", "p", clock.now(), &clock).await.unwrap();
        let claimed = store.claim_due_timers(5, 10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap();
        assert_eq!(claimed[0].id, id);
    }
}
