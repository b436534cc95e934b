//! Wraps an idempotent call to a remote system behind a per-key record
//! (spec §4.5).

mod coordinator;
mod memory;
mod model;
mod sqlite;
mod store;

pub use coordinator::{execute, ExecuteConfig, ExecuteRequest};
pub use memory::InMemoryExternalEffectStore;
pub use model::{AttemptDecision, CheckOutcome, ExecuteOutcome, ExecuteResult, ExternalEffectRecord, ExternalEffectStatus};
pub use sqlite::SqliteExternalEffectStore;
pub use store::ExternalEffectStore;
