use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::dispatcher::handler::{Handler, HandlerOutcome};
use crate::inbox::{InboxRecord, InboxStore};
use crate::lease::LeaseStore;
use crate::time::Clock;

/// Lease-guarded polling loop over one inbox table (spec §4.3, §5). Mirrors
/// [`super::outbox::OutboxDispatcher`]'s loop shape; a `Retry` outcome here
/// abandons the claim for immediate reclaim rather than scheduling a future
/// due time, since inbox rows have no `RetryCount`-driven backoff in the
/// spec — repeat delivery is the transport's job.
pub struct InboxDispatcher<S: InboxStore> {
    store: Arc<S>,
    lease_store: Arc<dyn LeaseStore>,
    handler: Arc<dyn Handler<InboxRecord>>,
    clock: Arc<dyn Clock>,
    resource: String,
    batch_size: u32,
    claim_lease_duration: Duration,
    poll_interval: Duration,
}

impl<S: InboxStore + 'static> InboxDispatcher<S> {
    pub fn new(
        store: Arc<S>,
        lease_store: Arc<dyn LeaseStore>,
        handler: Arc<dyn Handler<InboxRecord>>,
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
        }
    }

    pub async fn run(&self, owner: Uuid, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let lease = tokio::select! {
                _ = cancel.cancelled() => return,
                lease = self.lease_store.acquire(&self.resource, Some(owner), self.claim_lease_duration, self.clock.as_ref()) => lease,
            };
            match lease {
                Ok(Some(_)) => {}
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
            }

            let claimed = self
                .store
                .claim_due(self.batch_size, self.claim_lease_duration, owner, self.clock.as_ref())
                .await
                .unwrap_or_else(|err| {
                    warn!(resource = %self.resource, %err, "claim_due failed");
                    Vec::new()
                });

            if claimed.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            for record in &claimed {
                if cancel.is_cancelled() {
                    return;
                }
                self.process_one(owner, record).await;
            }
        }
    }

    async fn process_one(&self, owner: Uuid, record: &InboxRecord) {
        match self.handler.handle(record).await {
            HandlerOutcome::Ack => {
                if let Err(err) = self
                    .store
                    .mark_processed(owner, &record.message_id, &record.source, self.clock.as_ref())
                    .await
                {
                    warn!(message_id = %record.message_id, %err, "mark_processed failed");
                }
            }
            HandlerOutcome::Retry { error } => {
                warn!(message_id = %record.message_id, %error, "inbox handler requested retry");
                if let Err(err) = self.store.abandon(owner, &record.message_id, &record.source).await {
                    warn!(message_id = %record.message_id, %err, "abandon failed");
                }
            }
            HandlerOutcome::Permanent { error } => {
                warn!(message_id = %record.message_id, %error, "inbox message dead-lettered");
                if let Err(err) = self.store.mark_dead(owner, &record.message_id, &record.source).await {
                    warn!(message_id = %record.message_id, %err, "mark_dead failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler::FnHandler;
    use crate::inbox::{InboxStatus, SqliteInboxStore};
    use crate::lease::SqliteLeaseStore;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn dead_letters_on_permanent_failure() {
        let pool = crate::storage::memory_pool().await;
        let inbox = Arc::new(SqliteInboxStore::new(pool.clone()));
        let leases = Arc::new(SqliteLeaseStore::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        inbox
            .enqueue("msg-1", "webhook", "order.created", "{}", None, None, clock.as_ref())
            .await
            .unwrap();

        let handler = Arc::new(FnHandler(|_rec: &InboxRecord| async {
            HandlerOutcome::Permanent { error: "unsupported schema version".to_string() }
        }));

        let dispatcher = InboxDispatcher::new(
            inbox.clone(),
            leases,
            handler,
            clock.clone(),
            "dispatcher:webhook",
            10,
            Duration::from_secs(30),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel2.cancel();
        });
        dispatcher.run(Uuid::new_v4(), cancel).await;

        let record = inbox.get("msg-1", "webhook").await.unwrap().unwrap();
        assert_eq!(record.status, InboxStatus::Dead);
    }
}
