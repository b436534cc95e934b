use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::lease::model::Lease;
use crate::time::Clock;

/// Fenced, time-bounded exclusive ownership of a named resource (spec §4.1).
///
/// Implementations must guarantee the fencing contract: for any given
/// `resource`, the sequence of fencing tokens observed by successful
/// `acquire`/`try_renew_now` calls is strictly increasing (spec invariant 4).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire `resource` for `duration`. Returns `Ok(Some(lease))` when
    /// either no row exists, the existing row is expired, or the caller
    /// already owns it. Returns `Ok(None)` when a different owner holds an
    /// unexpired lease. If `owner_token` is `None` a fresh one is generated.
    async fn acquire(
        &self,
        resource: &str,
        owner_token: Option<Uuid>,
        duration: Duration,
        clock: &dyn Clock,
    ) -> Result<Option<Lease>>;

    /// Atomically extend `lease`'s expiry to `now + duration` and bump its
    /// fencing token. Succeeds (and mutates `lease` in place) iff the lease
    /// has not been lost; on failure, marks `lease`'s cancellation signal.
    async fn try_renew_now(&self, lease: &mut Lease, duration: Duration, clock: &dyn Clock) -> Result<bool>;

    /// Clear the row so `resource` may be reacquired by anyone.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// The fencing token currently persisted for `resource`, or `0` if no
    /// row exists yet (spec §9 open question: a resource queried before any
    /// acquire legitimately reads `0`).
    async fn current_fencing_token(&self, resource: &str) -> Result<i64>;
}

/// Raise [`crate::error::PlatformError::LeaseLost`] if `lease` is expired as
/// of `clock.now()`, marking its cancellation signal first.
pub fn throw_if_lost(lease: &Lease, clock: &dyn Clock) -> Result<()> {
    if lease.is_lost_at(clock.now()) {
        lease.mark_lost();
        return Err(crate::error::PlatformError::LeaseLost {
            resource: lease.resource.clone(),
        });
    }
    Ok(())
}
