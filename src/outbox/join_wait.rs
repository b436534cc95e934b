//! `join.wait` message payload and enqueue helper (spec §4.2.1). The poll
//! handler itself lives in [`crate::dispatcher`] since evaluating it is a
//! dispatcher concern (it needs the `Handler` trait); this module only
//! owns the wire shape and the convenience constructor, so callers don't
//! need to hand-roll the JSON payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::outbox::model::JoinCompletionPolicy;
use crate::outbox::store::OutboxStore;
use crate::time::Clock;

/// A topic + payload to enqueue once a join reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub topic: String,
    pub payload: String,
}

/// Body of a `join.wait` outbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitPayload {
    pub join_id: Uuid,
    pub on_complete: FollowUp,
    pub on_fail: FollowUp,
    pub policy: JoinCompletionPolicy,
}

/// Enqueue a self-retrying `join.wait` message for `join_id`. Its handler
/// (see `crate::dispatcher::JoinWaitHandler`) abandons for retry while
/// members are still outstanding, then enqueues `on_complete` or `on_fail`
/// per `policy` exactly once and finalizes the join.
pub async fn enqueue_join_wait<S: OutboxStore + ?Sized>(
    store: &S,
    join_id: Uuid,
    on_complete: FollowUp,
    on_fail: FollowUp,
    policy: JoinCompletionPolicy,
    clock: &dyn Clock,
) -> Result<Uuid> {
    let payload = JoinWaitPayload { join_id, on_complete, on_fail, policy };
    let body = serde_json::to_string(&payload).expect("JoinWaitPayload is always serializable");
    store.enqueue("join.wait", &body, None, None, clock).await
}
