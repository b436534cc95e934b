use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::inbox::model::{validate_key, InboxRecord, InboxStatus};
use crate::inbox::store::InboxStore;
use crate::outbox::store::validate_batch_size;
use crate::time::Clock;

/// In-memory [`InboxStore`] conformance reference, keyed the same way as
/// the SQLite store: `(message_id, source)`.
#[derive(Default)]
pub struct InMemoryInboxStore {
    rows: Mutex<HashMap<(String, String), InboxRecord>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn already_processed(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<bool> {
        validate_key(message_id, source)?;
        let now = clock.now();
        let mut rows = self.rows.lock().unwrap();
        let key = (message_id.to_string(), source.to_string());
        let record = rows.entry(key).or_insert_with(|| InboxRecord {
            message_id: message_id.to_string(),
            source: source.to_string(),
            topic: None,
            payload: None,
            hash: hash.map(|s| s.to_string()),
            first_seen_utc: now,
            last_seen_utc: now,
            processed_utc: None,
            attempts: 0,
            status: InboxStatus::Seen,
            owner_token: None,
            locked_until: None,
            due_time_utc: None,
        });
        record.last_seen_utc = now;
        record.attempts += 1;
        Ok(record.processed_utc.is_some())
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
        let now = clock.now();
        let mut rows = self.rows.lock().unwrap();
        let key = (message_id.to_string(), source.to_string());
        match rows.get_mut(&key) {
            Some(record) => {
                record.last_seen_utc = now;
                record.attempts += 1;
            }
            None => {
                rows.insert(
                    key,
                    InboxRecord {
                        message_id: message_id.to_string(),
                        source: source.to_string(),
                        topic: Some(topic.to_string()),
                        payload: Some(payload.to_string()),
                        hash: hash.map(|s| s.to_string()),
                        first_seen_utc: now,
                        last_seen_utc: now,
                        processed_utc: None,
                        attempts: 1,
                        status: InboxStatus::Seen,
                        owner_token: None,
                        locked_until: None,
                        due_time_utc: due_time,
                    },
                );
            }
        }
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
        let mut rows = self.rows.lock().unwrap();

        let mut candidates: Vec<(String, String)> = rows
            .values()
            .filter(|r| r.status == InboxStatus::Seen && r.due_time_utc.map(|d| d <= now).unwrap_or(true))
            .map(|r| (r.message_id.clone(), r.source.clone()))
            .collect();
        candidates.sort_by_key(|k| (rows[k].due_time_utc, rows[k].first_seen_utc));
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for key in candidates {
            let r = rows.get_mut(&key).unwrap();
            r.status = InboxStatus::Processing;
            r.owner_token = Some(owner);
            r.locked_until = Some(locked_until);
            claimed.push(r.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, owner: Uuid, message_id: &str, source: &str, clock: &dyn Clock) -> Result<()> {
        validate_key(message_id, source)?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(message_id.to_string(), source.to_string())) {
            if r.owner_token == Some(owner) {
                r.status = InboxStatus::Done;
                r.processed_utc = Some(clock.now());
            }
        }
        Ok(())
    }

    async fn abandon(&self, owner: Uuid, message_id: &str, source: &str) -> Result<()> {
        validate_key(message_id, source)?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(message_id.to_string(), source.to_string())) {
            if r.owner_token == Some(owner) {
                r.status = InboxStatus::Seen;
                r.owner_token = None;
                r.locked_until = None;
            }
        }
        Ok(())
    }

    async fn mark_dead(&self, owner: Uuid, message_id: &str, source: &str) -> Result<()> {
        validate_key(message_id, source)?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(message_id.to_string(), source.to_string())) {
            if r.owner_token == Some(owner) {
                r.status = InboxStatus::Dead;
                r.owner_token = None;
                r.locked_until = None;
            }
        }
        Ok(())
    }

    async fn revive(&self, message_id: &str, source: &str) -> Result<()> {
        validate_key(message_id, source)?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(&(message_id.to_string(), source.to_string())) {
            if r.status == InboxStatus::Dead {
                r.status = InboxStatus::Seen;
            }
        }
        Ok(())
    }

    async fn reap_expired(&self, batch_size: u32, clock: &dyn Clock) -> Result<u64> {
        validate_batch_size(batch_size)?;
        let now = clock.now();
        let mut rows = self.rows.lock().unwrap();
        let mut expired: Vec<(String, String)> = rows
            .values()
            .filter(|r| r.status == InboxStatus::Processing && r.locked_until.map(|l| l <= now).unwrap_or(false))
            .map(|r| (r.message_id.clone(), r.source.clone()))
            .collect();
        expired.sort_by_key(|k| rows[k].locked_until);
        expired.truncate(batch_size as usize);

        for key in &expired {
            let r = rows.get_mut(key).unwrap();
            r.status = InboxStatus::Seen;
            r.owner_token = None;
            r.locked_until = None;
        }
        Ok(expired.len() as u64)
    }

    async fn get(&self, message_id: &str, source: &str) -> Result<Option<InboxRecord>> {
        Ok(self.rows.lock().unwrap().get(&(message_id.to_string(), source.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn matches_sqlite_dedup_contract() {
        let store = InMemoryInboxStore::new();
        let clock = SystemClock;
        assert!(!store.already_processed("m1", "src", None, &clock).await.unwrap());
        let owner = Uuid::new_v4();
        store.claim_due(10, Duration::from_secs(30), owner, &clock).await.unwrap();
        store.mark_processed(owner, "m1", "src", &clock).await.unwrap();
        assert!(store.already_processed("m1", "src", None, &clock).await.unwrap());
    }
}
