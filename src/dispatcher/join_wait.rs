use std::sync::Arc;
use tracing::warn;

use crate::dispatcher::handler::{Handler, HandlerOutcome};
use crate::outbox::{JoinStatus, JoinWaitPayload, OutboxMessage, OutboxStore};
use crate::time::Clock;

/// Evaluates a `join.wait` message (spec §4.2.1): reads the join's
/// counters and, once every member has reported, enqueues exactly one of
/// `onComplete`/`onFail` per `policy` and finalizes the join — gated on
/// `finalize_join`'s atomic Pending→terminal CAS, so a retried or
/// concurrently-claimed `join.wait` never enqueues the follow-up twice.
/// While members are still outstanding it abandons itself for retry.
pub struct JoinWaitHandler<S: OutboxStore> {
    store: Arc<S>,
}

impl<S: OutboxStore> JoinWaitHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl<S: OutboxStore + 'static> Handler<OutboxMessage> for JoinWaitHandler<S> {
    async fn handle(&self, message: &OutboxMessage) -> HandlerOutcome {
        let payload: JoinWaitPayload = match serde_json::from_str(&message.payload) {
            Ok(p) => p,
            Err(e) => return HandlerOutcome::Permanent { error: format!("malformed join.wait payload: {e}") },
        };

        let join = match self.store.get_join(payload.join_id).await {
            Ok(Some(join)) => join,
            Ok(None) => return HandlerOutcome::Permanent { error: format!("unknown join {}", payload.join_id) },
            Err(e) => return HandlerOutcome::Retry { error: e.to_string() },
        };

        if join.is_awaiting_members() {
            return HandlerOutcome::Retry { error: "join is still awaiting members".to_string() };
        }

        let any_failed = join.failed_steps > 0;
        let all_failed = join.failed_steps == join.expected_steps;
        let route_to_fail = if payload.policy.fail_if_any_step_failed { any_failed } else { all_failed };

        let (new_status, follow_up) =
            if route_to_fail { (JoinStatus::Failed, &payload.on_fail) } else { (JoinStatus::Completed, &payload.on_complete) };

        // Clock is only needed to stamp `last_updated_utc`; the dispatcher
        // loop that calls `handle` doesn't thread one through, so each
        // primitive's own system clock is used here for that timestamp.
        let clock = crate::time::SystemClock;
        match self.store.finalize_join(payload.join_id, new_status, &clock).await {
            Ok(true) => {
                if let Err(e) =
                    self.store.enqueue(&follow_up.topic, &follow_up.payload, None, None, &clock).await
                {
                    warn!(join_id = %payload.join_id, err = %e, "failed to enqueue join follow-up");
                    return HandlerOutcome::Retry { error: e.to_string() };
                }
                HandlerOutcome::Ack
            }
            Ok(false) => {
                // Already finalized by a previous attempt — the follow-up
                // was already enqueued then. Nothing left to do.
                HandlerOutcome::Ack
            }
            Err(e) => HandlerOutcome::Retry { error: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::SqliteOutboxStore;
    use crate::time::SystemClock;
    use uuid::Uuid;

    #[tokio::test]
    async fn s3_join_with_fail_if_any_step_failed_enqueues_on_fail_exactly_once() {
        let pool = crate::storage::memory_pool().await;
        let store = Arc::new(SqliteOutboxStore::new(pool));
        let clock = SystemClock;

        let join_id = store.create_join("tenant-a", 3, None, &clock).await.unwrap();
        let msg1 = store.enqueue("step", "{}", None, None, &clock).await.unwrap();
        let msg2 = store.enqueue("step", "{}", None, None, &clock).await.unwrap();
        let msg3 = store.enqueue("step", "{}", None, None, &clock).await.unwrap();
        store.attach(join_id, msg1).await.unwrap();
        store.attach(join_id, msg2).await.unwrap();
        store.attach(join_id, msg3).await.unwrap();

        let owner = Uuid::new_v4();
        store.claim_due(10, std::time::Duration::from_secs(30), owner, &clock).await.unwrap();
        store.mark_dispatched(owner, msg1, &clock).await.unwrap();
        store.mark_dispatched(owner, msg2, &clock).await.unwrap();
        store.fail(owner, msg3, "boom", &clock).await.unwrap();

        let join = store.get_join(join_id).await.unwrap().unwrap();
        assert_eq!(join.completed_steps, 2);
        assert_eq!(join.failed_steps, 1);

        let payload = crate::outbox::JoinWaitPayload {
            join_id,
            on_complete: crate::outbox::FollowUp { topic: "on.complete".to_string(), payload: "{}".to_string() },
            on_fail: crate::outbox::FollowUp { topic: "on.fail".to_string(), payload: "{}".to_string() },
            policy: crate::outbox::JoinCompletionPolicy { fail_if_any_step_failed: true },
        };
        let wait_msg = OutboxMessage {
            id: Uuid::new_v4(),
            topic: "join.wait".to_string(),
            payload: serde_json::to_string(&payload).unwrap(),
            correlation_id: None,
            due_time_utc: clock.now(),
            retry_count: 0,
            last_error: None,
            owner_token: None,
            locked_until: None,
            status: crate::outbox::OutboxStatus::InProgress,
            created_at: clock.now(),
        };

        let handler = JoinWaitHandler::new(store.clone());
        assert!(matches!(handler.handle(&wait_msg).await, HandlerOutcome::Ack));

        // A second evaluation (e.g. a duplicate claim) must not enqueue a
        // second onFail.
        assert!(matches!(handler.handle(&wait_msg).await, HandlerOutcome::Ack));

        let ready = store.claim_due(10, std::time::Duration::from_secs(30), Uuid::new_v4(), &clock).await.unwrap();
        let on_fail: Vec<_> = ready.iter().filter(|m| m.topic == "on.fail").collect();
        assert_eq!(on_fail.len(), 1);

        let join = store.get_join(join_id).await.unwrap().unwrap();
        assert_eq!(join.status, crate::outbox::JoinStatus::Failed);
    }
}
