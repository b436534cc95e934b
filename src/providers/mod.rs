//! Resolves a stable string key to a database's primitive stores; supports
//! static lists, dynamic discovery with periodic refresh, and a
//! single-database default (spec §4.6).

mod database;
mod dynamic;
mod single;
mod static_list;

use async_trait::async_trait;
use std::sync::Arc;

pub use database::DatabaseStores;
pub use dynamic::{DiscoveredDatabase, DiscoveryCallback, DynamicStoreProvider};
pub use single::SingleStoreProvider;
pub use static_list::StaticListStoreProvider;

#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Resolve `key` to its stores, or `None` if `key` is not (currently)
    /// known to this provider.
    async fn resolve(&self, key: &str) -> Option<Arc<DatabaseStores>>;

    /// All keys currently known to this provider, for dispatcher fan-out.
    async fn keys(&self) -> Vec<String>;
}
