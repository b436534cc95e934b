use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::outbox::model::{JoinStatus, OutboxJoin, OutboxMessage, OutboxStatus};
use crate::outbox::store::{validate_batch_size, OutboxStore};
use crate::time::Clock;

#[derive(Default)]
struct State {
    messages: HashMap<Uuid, OutboxMessage>,
    joins: HashMap<Uuid, OutboxJoin>,
    /// join_id -> (message_id -> reported)
    members: HashMap<Uuid, HashMap<Uuid, bool>>,
}

/// In-memory [`OutboxStore`] conformance reference. Mirrors the SQLite
/// store's exact semantics (same ordering, same join-counter invariants)
/// under a single `Mutex`, since there's no concurrent writer story to
/// preserve without a real database.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<State>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(
        &self,
        topic: &str,
        payload: &str,
        correlation_id: Option<&str>,
        due_time: Option<DateTime<Utc>>,
        clock: &dyn Clock,
    ) -> Result<Uuid> {
        let now = clock.now();
        let id = Uuid::new_v4();
        let msg = OutboxMessage {
            id,
            topic: topic.to_string(),
            payload: payload.to_string(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            due_time_utc: due_time.unwrap_or(now),
            retry_count: 0,
            last_error: None,
            owner_token: None,
            locked_until: None,
            status: OutboxStatus::Ready,
            created_at: now,
        };
        self.state.lock().unwrap().messages.insert(id, msg);
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
        let mut state = self.state.lock().unwrap();

        let mut candidates: Vec<Uuid> = state
            .messages
            .values()
            .filter(|m| m.status == OutboxStatus::Ready && m.due_time_utc <= now)
            .map(|m| m.id)
            .collect();
        // HashMap has no stable order; insertion order is approximated by
        // sorting on (due_time, created_at) which matches the SQLite store's
        // (due_time_utc, rowid) tie-break for any distinct due times, and is
        // close enough for equal due times inserted via this same process.
        candidates.sort_by_key(|id| {
            let m = &state.messages[id];
            (m.due_time_utc, m.created_at)
        });
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let m = state.messages.get_mut(&id).unwrap();
            m.status = OutboxStatus::InProgress;
            m.owner_token = Some(owner);
            m.locked_until = Some(locked_until);
            claimed.push(m.clone());
        }
        Ok(claimed)
    }

    async fn mark_dispatched(&self, owner: Uuid, id: Uuid, clock: &dyn Clock) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !owns(&state, id, owner) {
            return Ok(());
        }
        state.messages.get_mut(&id).unwrap().status = OutboxStatus::Acknowledged;
        bump_join_counters(&mut state, id, clock.now(), true);
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
        let mut state = self.state.lock().unwrap();
        if !owns(&state, id, owner) {
            return Ok(());
        }
        let due = clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let m = state.messages.get_mut(&id).unwrap();
        m.status = OutboxStatus::Ready;
        m.due_time_utc = due;
        m.retry_count += 1;
        m.last_error = Some(last_error.to_string());
        m.owner_token = None;
        m.locked_until = None;
        Ok(())
    }

    async fn fail(&self, owner: Uuid, id: Uuid, last_error: &str, clock: &dyn Clock) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !owns(&state, id, owner) {
            return Ok(());
        }
        {
            let m = state.messages.get_mut(&id).unwrap();
            m.status = OutboxStatus::Failed;
            m.last_error = Some(last_error.to_string());
        }
        bump_join_counters(&mut state, id, clock.now(), false);
        Ok(())
    }

    async fn reap_expired(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let mut state = self.state.lock().unwrap();
        let mut expired: Vec<Uuid> = state
            .messages
            .values()
            .filter(|m| m.status == OutboxStatus::InProgress && m.locked_until.map(|l| l <= now).unwrap_or(false))
            .map(|m| m.id)
            .collect();
        expired.sort_by_key(|id| state.messages[id].locked_until);
        expired.truncate(batch_size as usize);

        for id in &expired {
            let m = state.messages.get_mut(id).unwrap();
            m.status = OutboxStatus::Ready;
            m.owner_token = None;
            m.locked_until = None;
        }
        Ok(expired.len() as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        Ok(self.state.lock().unwrap().messages.get(&id).cloned())
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
        let now = clock.now();
        let join_id = Uuid::new_v4();
        let join = OutboxJoin {
            join_id,
            tenant_id: tenant_id.to_string(),
            expected_steps,
            completed_steps: 0,
            failed_steps: 0,
            status: JoinStatus::Pending,
            metadata: metadata.map(|s| s.to_string()),
            created_utc: now,
            last_updated_utc: now,
        };
        let mut state = self.state.lock().unwrap();
        state.joins.insert(join_id, join);
        state.members.insert(join_id, HashMap::new());
        Ok(join_id)
    }

    async fn get_join(&self, join_id: Uuid) -> Result<Option<OutboxJoin>> {
        Ok(self.state.lock().unwrap().joins.get(&join_id).cloned())
    }

    async fn attach(&self, join_id: Uuid, message_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.members.entry(join_id).or_default().entry(message_id).or_insert(false);
        Ok(())
    }

    async fn finalize_join(&self, join_id: Uuid, new_status: JoinStatus, clock: &dyn Clock) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let now = clock.now();
        match state.joins.get_mut(&join_id) {
            Some(join) if join.status == JoinStatus::Pending && join.reported_steps() == join.expected_steps => {
                join.status = new_status;
                join.last_updated_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn owns(state: &State, id: Uuid, owner: Uuid) -> bool {
    state.messages.get(&id).map(|m| m.owner_token == Some(owner)).unwrap_or(false)
}

fn bump_join_counters(state: &mut State, message_id: Uuid, now: DateTime<Utc>, completed: bool) {
    let memberships: Vec<Uuid> = state
        .members
        .iter()
        .filter(|(_, members)| members.get(&message_id).map(|reported| !*reported).unwrap_or(false))
        .map(|(join_id, _)| *join_id)
        .collect();

    for join_id in memberships {
        if let Some(join) = state.joins.get_mut(&join_id) {
            if completed {
                join.completed_steps += 1;
            } else {
                join.failed_steps += 1;
            }
            join.last_updated_utc = now;
        }
        if let Some(members) = state.members.get_mut(&join_id) {
            members.insert(message_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn matches_sqlite_claim_contract() {
        let store = InMemoryOutboxStore::new();
        let clock = SystemClock;
        let id = store.enqueue("t", "p", None, None, &clock).await.unwrap();
        let claimed = store.claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap();
        assert_eq!(claimed[0].id, id);
        assert!(store.claim_due(10, Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_completes_once_all_members_report() {
        let store = InMemoryOutboxStore::new();
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
        assert!(store.finalize_join(join, JoinStatus::Completed, &clock).await.unwrap());
    }
}
