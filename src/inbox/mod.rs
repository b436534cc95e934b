//! Idempotent, at-most-once message intake with dedup and dead-lettering
//! (spec §4.3).

mod memory;
mod model;
mod sqlite;
mod store;

pub use memory::InMemoryInboxStore;
pub use model::{InboxRecord, InboxStatus};
pub use sqlite::SqliteInboxStore;
pub use store::InboxStore;
