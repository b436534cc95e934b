//! Fenced, time-bounded exclusive ownership of a named resource (spec §4.1).
//!
//! Dispatchers use a [`LeaseStore`] to coordinate across competing workers
//! and across multiple customer databases, keyed `primitive:run:<database>`
//! (spec §4.6). The fencing token it hands out is strictly monotonic per
//! key, so stores may reject writes tagged with a stale token.

mod memory;
mod model;
mod sqlite;
mod store;

pub use memory::InMemoryLeaseStore;
pub use model::Lease;
pub use sqlite::SqliteLeaseStore;
pub use store::{throw_if_lost, LeaseStore};
