use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::{DatabaseStores, StoreProvider};

/// An explicit, fixed list of databases known at startup. No background
/// refresh; add/remove requires a restart.
pub struct StaticListStoreProvider {
    stores: HashMap<String, Arc<DatabaseStores>>,
}

impl StaticListStoreProvider {
    /// Connect every `(key, connection_string)` pair up front.
    pub async fn connect(databases: &[(&str, &str)]) -> anyhow::Result<Self> {
        let mut stores = HashMap::with_capacity(databases.len());
        for (key, connection_string) in databases {
            stores.insert((*key).to_string(), Arc::new(DatabaseStores::connect(connection_string).await?));
        }
        Ok(Self { stores })
    }
}

#[async_trait]
impl StoreProvider for StaticListStoreProvider {
    async fn resolve(&self, key: &str) -> Option<Arc<DatabaseStores>> {
        self.stores.get(key).cloned()
    }

    async fn keys(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_each_configured_key_independently() {
        let provider = StaticListStoreProvider::connect(&[("a", "sqlite::memory:"), ("b", "sqlite::memory:")])
            .await
            .unwrap();
        assert!(provider.resolve("a").await.is_some());
        assert!(provider.resolve("b").await.is_some());
        assert!(provider.resolve("c").await.is_none());
        assert_eq!(provider.keys().await.len(), 2);
    }
}
