use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::providers::{DatabaseStores, StoreProvider};

/// One row returned by a [`DiscoveryCallback`] sweep.
#[derive(Debug, Clone)]
pub struct DiscoveredDatabase {
    pub identifier: String,
    pub connection_string: String,
}

/// Environment hook for dynamic mode (spec §6 "Discovery callback").
#[async_trait]
pub trait DiscoveryCallback: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<DiscoveredDatabase>>;
}

struct Entry {
    connection_string: String,
    stores: Arc<DatabaseStores>,
}

/// Polls a [`DiscoveryCallback`] at a configured interval. New identifiers
/// get a store constructed; removed ones are disposed; a changed connection
/// string reconstructs the store. Refresh is serialised by a semaphore so at
/// most one sweep runs at a time; callers of `resolve`/`keys` see a
/// consistent snapshot copied under a brief mutex (spec §4.6, §9).
pub struct DynamicStoreProvider {
    discovery: Arc<dyn DiscoveryCallback>,
    observed: Mutex<HashMap<String, Entry>>,
    refresh_gate: Semaphore,
}

impl DynamicStoreProvider {
    pub fn new(discovery: Arc<dyn DiscoveryCallback>) -> Self {
        Self { discovery, observed: Mutex::new(HashMap::new()), refresh_gate: Semaphore::new(1) }
    }

    /// Run one discovery sweep, reconciling constructed stores against what
    /// the callback reports. Returns without doing anything if another
    /// refresh is already in flight... no: it waits for the gate, since a
    /// caller explicitly asking for a refresh expects one to happen.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let _permit = self.refresh_gate.acquire().await.expect("semaphore never closed");
        let discovered = self.discovery.discover().await?;

        let mut next = HashMap::with_capacity(discovered.len());
        {
            let mut current = self.observed.lock().await;
            for db in discovered {
                match current.remove(&db.identifier) {
                    Some(entry) if entry.connection_string == db.connection_string => {
                        next.insert(db.identifier, entry);
                    }
                    Some(_stale) => {
                        info!(database = %db.identifier, "connection string changed, reconstructing store");
                        let stores = Arc::new(DatabaseStores::connect(&db.connection_string).await?);
                        next.insert(db.identifier.clone(), Entry { connection_string: db.connection_string, stores });
                    }
                    None => {
                        info!(database = %db.identifier, "discovered new database");
                        let stores = Arc::new(DatabaseStores::connect(&db.connection_string).await?);
                        next.insert(db.identifier.clone(), Entry { connection_string: db.connection_string, stores });
                    }
                }
            }
            for removed in current.keys() {
                info!(database = %removed, "database no longer discovered, disposing store");
            }
            *current = next;
        }
        Ok(())
    }

    /// Spawn a background loop that refreshes on `interval` until
    /// `cancel` fires.
    pub fn spawn_refresh_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            warn!(%err, "dynamic store discovery refresh failed");
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl StoreProvider for DynamicStoreProvider {
    async fn resolve(&self, key: &str) -> Option<Arc<DatabaseStores>> {
        self.observed.lock().await.get(key).map(|e| e.stores.clone())
    }

    async fn keys(&self) -> Vec<String> {
        self.observed.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDiscovery {
        databases: Mutex<Vec<DiscoveredDatabase>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryCallback for FixedDiscovery {
        async fn discover(&self) -> anyhow::Result<Vec<DiscoveredDatabase>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.databases.lock().await.clone())
        }
    }

    #[tokio::test]
    async fn refresh_adds_and_then_removes_a_database() {
        let discovery = Arc::new(FixedDiscovery {
            databases: Mutex::new(vec![DiscoveredDatabase {
                identifier: "db-a".to_string(),
                connection_string: "sqlite::memory:".to_string(),
            }]),
            calls: AtomicUsize::new(0),
        });
        let provider = DynamicStoreProvider::new(discovery.clone());
        provider.refresh().await.unwrap();
        assert!(provider.resolve("db-a").await.is_some());

        discovery.databases.lock().await.clear();
        provider.refresh().await.unwrap();
        assert!(provider.resolve("db-a").await.is_none());
    }

    #[tokio::test]
    async fn unchanged_connection_string_keeps_the_same_store_instance() {
        let discovery = Arc::new(FixedDiscovery {
            databases: Mutex::new(vec![DiscoveredDatabase {
                identifier: "db-a".to_string(),
                connection_string: "sqlite::memory:".to_string(),
            }]),
            calls: AtomicUsize::new(0),
        });
        let provider = DynamicStoreProvider::new(discovery);
        provider.refresh().await.unwrap();
        let first = provider.resolve("db-a").await.unwrap();
        provider.refresh().await.unwrap();
        let second = provider.resolve("db-a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
