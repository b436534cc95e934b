//! Error kinds shared by every primitive store.
//!
//! Store primitives only ever bubble [`PlatformError::InvalidArgument`],
//! [`PlatformError::LeaseLost`], and the terminal-failure variants — transient
//! I/O is retried locally by the dispatcher (see [`crate::dispatcher`]) and
//! surfaced only after its retry budget is exhausted.

use thiserror::Error;

/// Errors raised by the primitive engine (leases, outbox, inbox, scheduler,
/// external side-effects).
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Caller contract violation: empty id, `batchSize <= 0`, malformed cron
    /// expression, empty connection string, etc. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A claim mutation (ack/abandon/fail) was attempted by a token that does
    /// not currently own the row. Callers treat this as a silent no-op per
    /// spec; the variant exists so stores can log it before discarding it.
    #[error("caller does not own this claim")]
    NotOwner,

    /// The lease under which an operation executed has been lost (expired
    /// without renewal, or reacquired by another owner). The dispatcher
    /// aborts the current batch and reacquires.
    #[error("lease lost for resource {resource}")]
    LeaseLost { resource: String },

    /// Optimistic concurrency was lost (the row changed under us between
    /// read and write). Callers retry once locally, then surface this.
    #[error("conflicting concurrent update, retry")]
    ConflictRetry,

    /// Connection or timeout failure talking to the backing store. Retried
    /// locally with backoff by the dispatcher; surfaced after the budget.
    #[error("transient I/O error: {0}")]
    TransientIO(#[from] sqlx::Error),

    /// Terminal classification: the row is marked Failed and must never be
    /// reclaimed again.
    #[error("permanent failure: {0}")]
    PermanentFailure(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PlatformError::InvalidArgument(msg.into())
    }

    /// `true` for error kinds the dispatcher should retry locally before
    /// surfacing (spec §7 propagation policy).
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::TransientIO(_) | PlatformError::ConflictRetry)
    }
}
