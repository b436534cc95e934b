//! Lease-guarded polling loops that turn claimable rows into handler
//! invocations (spec §5 "Dispatcher"), one per primitive that has a claim
//! queue. Each loop acquires a lease over a logical resource name before
//! claiming, so at most one dispatcher instance services a given queue at
//! a time; a lost lease aborts the in-flight iteration rather than racing
//! a newer holder.
//!
//! Grounded on the teacher's `scheduler/backoff.rs` (poll/backoff shape)
//! and `retry.rs` (retry-on-transient-failure idiom).

pub mod backoff;
pub mod handler;
mod inbox;
mod join_wait;
mod outbox;
mod scheduler;

pub use inbox::InboxDispatcher;
pub use join_wait::JoinWaitHandler;
pub use outbox::OutboxDispatcher;
pub use scheduler::SchedulerDispatcher;
