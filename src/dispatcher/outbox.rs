use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::backoff::{next_backoff, BackoffConfig};
use crate::dispatcher::handler::{Handler, HandlerOutcome};
use crate::lease::LeaseStore;
use crate::outbox::{OutboxMessage, OutboxStore};
use crate::time::Clock;

/// Lease-guarded polling loop over one outbox table, dispatching each
/// claimed message to a [`Handler`] (spec §4.2, §5 "Dispatcher").
///
/// Grounded on the teacher's scheduler poll loop shape (acquire → claim →
/// process → sleep) combined with `retry.rs`'s backoff-on-failure pattern.
pub struct OutboxDispatcher<S: OutboxStore> {
    store: Arc<S>,
    lease_store: Arc<dyn LeaseStore>,
    handler: Arc<dyn Handler<OutboxMessage>>,
    clock: Arc<dyn Clock>,
    resource: String,
    batch_size: u32,
    claim_lease_duration: Duration,
    poll_interval: Duration,
    backoff: BackoffConfig,
}

impl<S: OutboxStore + 'static> OutboxDispatcher<S> {
    pub fn new(
        store: Arc<S>,
        lease_store: Arc<dyn LeaseStore>,
        handler: Arc<dyn Handler<OutboxMessage>>,
        clock: Arc<dyn Clock>,
        resource: impl Into<String>,
        batch_size: u32,
        claim_lease_duration: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            lease_store,
            handler,
            clock,
            resource: resource.into(),
            batch_size,
            claim_lease_duration,
            poll_interval,
            backoff: BackoffConfig::default(),
        }
    }

    /// Run until `cancel` fires. A lease over `self.resource` guards every
    /// poll so at most one dispatcher instance is ever claiming from this
    /// table at a time; a lost lease aborts the current iteration and
    /// retries acquisition rather than processing without exclusivity.
    pub async fn run(&self, owner: Uuid, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let lease = tokio::select! {
                _ = cancel.cancelled() => return,
                lease = self.lease_store.acquire(&self.resource, Some(owner), self.claim_lease_duration, self.clock.as_ref()) => lease,
            };
            let lease = match lease {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    warn!(resource = %self.resource, %err, "failed to acquire dispatcher lease");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            let claimed = self
                .store
                .claim_due(self.batch_size, self.claim_lease_duration, owner, self.clock.as_ref())
                .await;
            let claimed = match claimed {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(resource = %self.resource, %err, "claim_due failed");
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            for message in &claimed {
                if cancel.is_cancelled() {
                    // Best-effort: let the lock lapse and reap_expired will
                    // return it to Ready rather than racing a reschedule.
                    return;
                }
                self.process_one(owner, message).await;
            }
        }
    }

    async fn process_one(&self, owner: Uuid, message: &OutboxMessage) {
        match self.handler.handle(message).await {
            HandlerOutcome::Ack => {
                if let Err(err) = self.store.mark_dispatched(owner, message.id, self.clock.as_ref()).await {
                    warn!(id = %message.id, %err, "mark_dispatched failed");
                }
            }
            HandlerOutcome::Retry { error } => {
                let delay = next_backoff(message.retry_count, &self.backoff);
                if let Err(err) = self
                    .store
                    .reschedule(owner, message.id, delay, &error, self.clock.as_ref())
                    .await
                {
                    warn!(id = %message.id, %err, "reschedule failed");
                }
            }
            HandlerOutcome::Permanent { error } => {
                if let Err(err) = self.store.fail(owner, message.id, &error, self.clock.as_ref()).await {
                    warn!(id = %message.id, %err, "fail failed");
                }
                info!(id = %message.id, %error, "outbox message permanently failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler::FnHandler;
    use crate::lease::SqliteLeaseStore;
    use crate::outbox::SqliteOutboxStore;
    use crate::time::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatches_claimed_messages_and_acks_them() {
        let pool = crate::storage::memory_pool().await;
        let outbox = Arc::new(SqliteOutboxStore::new(pool.clone()));
        let leases = Arc::new(SqliteLeaseStore::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        outbox.enqueue("email.send", "{}", None, None, clock.as_ref()).await.unwrap();
        outbox.enqueue("email.send", "{}", None, None, clock.as_ref()).await.unwrap();

        let handled = Arc::new(AtomicUsize::new(0));
        let handled2 = handled.clone();
        let handler = Arc::new(FnHandler(move |_msg: &OutboxMessage| {
            let handled = handled2.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Ack
            }
        }));

        let dispatcher = OutboxDispatcher::new(
            outbox.clone(),
            leases,
            handler,
            clock.clone(),
            "dispatcher:email.send",
            10,
            Duration::from_secs(30),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });
        dispatcher.run(Uuid::new_v4(), cancel).await;

        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }
}
