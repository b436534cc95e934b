use async_trait::async_trait;
use std::sync::Arc;

use crate::providers::{DatabaseStores, StoreProvider};

/// One store, one key — the default shape for a single-database deployment.
pub struct SingleStoreProvider {
    key: String,
    stores: Arc<DatabaseStores>,
}

impl SingleStoreProvider {
    pub fn new(key: impl Into<String>, stores: DatabaseStores) -> Self {
        Self { key: key.into(), stores: Arc::new(stores) }
    }
}

#[async_trait]
impl StoreProvider for SingleStoreProvider {
    async fn resolve(&self, key: &str) -> Option<Arc<DatabaseStores>> {
        if key == self.key {
            Some(self.stores.clone())
        } else {
            None
        }
    }

    async fn keys(&self) -> Vec<String> {
        vec![self.key.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_only_its_own_key() {
        let stores = DatabaseStores::new(crate::storage::memory_pool().await);
        let provider = SingleStoreProvider::new("primary", stores);
        assert!(provider.resolve("primary").await.is_some());
        assert!(provider.resolve("other").await.is_none());
    }
}
