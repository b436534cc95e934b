//! Database-backed primitives for reliable distributed work: fenced
//! [`lease`]s, an at-least-once [`outbox`] with fan-in joins, an idempotent
//! [`inbox`], a cron-driven [`scheduler`], and an [`external_effect`]
//! coordinator for exactly-once side effects against third parties.
//!
//! A deployment wires these together through a [`providers::StoreProvider`]
//! (one database, a static list, or a dynamically discovered set), polls
//! them with the [`dispatcher`] loops, and runs [`retention`] and
//! [`diagnostics`] as ambient housekeeping — mirroring how the teacher's
//! daemon composes its `storage`, `task_engine`, and `health` modules
//! around a shared connection pool.

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod external_effect;
pub mod inbox;
pub mod lease;
pub mod outbox;
pub mod providers;
pub mod retention;
pub mod scheduler;
mod sqltime;
pub mod storage;
pub mod time;

pub use config::PlatformConfig;
pub use error::{PlatformError, Result};
pub use providers::DatabaseStores;
pub use time::{Clock, SharedClock, SystemClock};
