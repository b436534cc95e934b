use sqlx::SqlitePool;

use crate::external_effect::SqliteExternalEffectStore;
use crate::inbox::SqliteInboxStore;
use crate::lease::SqliteLeaseStore;
use crate::outbox::SqliteOutboxStore;
use crate::scheduler::SqliteSchedulerStore;

/// The five primitive stores for one logical database, all sharing a single
/// connection pool. This is what a [`super::StoreProvider`] resolves a
/// logical key to.
#[derive(Clone)]
pub struct DatabaseStores {
    pub lease: SqliteLeaseStore,
    pub outbox: SqliteOutboxStore,
    pub inbox: SqliteInboxStore,
    pub scheduler: SqliteSchedulerStore,
    pub external_effect: SqliteExternalEffectStore,
    /// Shared by every store above. Exposed directly for read-only
    /// cross-cutting queries (diagnostics snapshots, retention sweeps) that
    /// have no natural home on a single primitive's trait.
    pub pool: SqlitePool,
}

impl DatabaseStores {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            lease: SqliteLeaseStore::new(pool.clone()),
            outbox: SqliteOutboxStore::new(pool.clone()),
            inbox: SqliteInboxStore::new(pool.clone()),
            scheduler: SqliteSchedulerStore::new(pool.clone()),
            external_effect: SqliteExternalEffectStore::new(pool.clone()),
            pool,
        }
    }

    /// Open `connection_string` (creating and migrating it if needed) and
    /// wrap it in every primitive store.
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        Ok(Self::new(crate::storage::connect(connection_string).await?))
    }
}
