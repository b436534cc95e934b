use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::lease::model::Lease;
use crate::lease::store::LeaseStore;
use crate::time::Clock;

struct Row {
    owner_token: Uuid,
    fencing_token: i64,
    expires_at: DateTime<Utc>,
}

/// In-memory [`LeaseStore`] — the conformance reference implementation
/// named in spec §1, useful for single-process tests and examples with no
/// database available.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    rows: Mutex<HashMap<String, Row>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
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

        let mut rows = self.rows.lock().unwrap();
        match rows.get(resource) {
            Some(row) if row.expires_at > now && row.owner_token != new_owner => Ok(None),
            Some(row) => {
                let fencing_token = row.fencing_token + 1;
                rows.insert(
                    resource.to_string(),
                    Row {
                        owner_token: new_owner,
                        fencing_token,
                        expires_at,
                    },
                );
                Ok(Some(Lease::new(resource.to_string(), new_owner, fencing_token, expires_at)))
            }
            None => {
                rows.insert(
                    resource.to_string(),
                    Row {
                        owner_token: new_owner,
                        fencing_token: 1,
                        expires_at,
                    },
                );
                Ok(Some(Lease::new(resource.to_string(), new_owner, 1, expires_at)))
            }
        }
    }

    async fn try_renew_now(&self, lease: &mut Lease, duration: Duration, clock: &dyn Clock) -> Result<bool> {
        let now = clock.now();
        let expires_at = now + chrono::Duration::from_std(duration).unwrap_or_default();
        let mut rows = self.rows.lock().unwrap();

        match rows.get_mut(&lease.resource) {
            Some(row)
                if row.owner_token == lease.owner_token
                    && row.fencing_token == lease.fencing_token
                    && row.expires_at > now =>
            {
                row.fencing_token += 1;
                row.expires_at = expires_at;
                lease.fencing_token = row.fencing_token;
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => {
                lease.mark_lost();
                Ok(false)
            }
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get(&lease.resource) {
            if row.owner_token == lease.owner_token && row.fencing_token == lease.fencing_token {
                rows.remove(&lease.resource);
            }
        }
        Ok(())
    }

    async fn current_fencing_token(&self, resource: &str) -> Result<i64> {
        Ok(self.rows.lock().unwrap().get(resource).map(|r| r.fencing_token).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestClock;

    #[tokio::test]
    async fn matches_sqlite_fencing_contract() {
        let store = InMemoryLeaseStore::new();
        let clock = TestClock::new(Utc::now());
        let l1 = store.acquire("k", None, Duration::from_secs(10), &clock).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11));
        let l2 = store.acquire("k", None, Duration::from_secs(10), &clock).await.unwrap().unwrap();
        assert!(l2.fencing_token > l1.fencing_token);
    }

    #[tokio::test]
    async fn renew_fails_once_owned_lease_has_expired_but_not_been_reacquired() {
        let store = InMemoryLeaseStore::new();
        let clock = TestClock::new(Utc::now());
        let mut lease = store.acquire("k", None, Duration::from_secs(1), &clock).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(2));
        let ok = store.try_renew_now(&mut lease, Duration::from_secs(30), &clock).await.unwrap();
        assert!(!ok);
    }
}
