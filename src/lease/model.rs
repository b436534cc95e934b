use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A held [`crate::lease`] — fenced, time-bounded exclusive ownership of a
/// named resource (spec §4.1).
///
/// `cancellation_signal()` fires exactly once when the holder (or anyone
/// polling on its behalf) observes the lease lost: expiry passed without
/// renewal, or the row was claimed by a different owner (spec §2.3, §5).
#[derive(Clone)]
pub struct Lease {
    pub resource: String,
    pub owner_token: Uuid,
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
    pub(crate) cancel: CancellationToken,
}

impl Lease {
    pub(crate) fn new(resource: String, owner_token: Uuid, fencing_token: i64, expires_at: DateTime<Utc>) -> Self {
        Self {
            resource,
            owner_token,
            fencing_token,
            expires_at,
            cancel: CancellationToken::new(),
        }
    }

    /// A signal that fires exactly once when this lease is observed lost.
    pub fn cancellation_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_lost_at(&self, now: DateTime<Utc>) -> bool {
        self.cancel.is_cancelled() || self.expires_at <= now
    }

    pub(crate) fn mark_lost(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("resource", &self.resource)
            .field("owner_token", &self.owner_token)
            .field("fencing_token", &self.fencing_token)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
