use async_trait::async_trait;

/// What a dispatcher should do with a claimed row after a handler runs.
pub enum HandlerOutcome {
    /// Acknowledge — terminal success.
    Ack,
    /// Transient failure: return the row to claimable state after a backoff
    /// delay. Does not count against a join's Failed tally.
    Retry { error: String },
    /// Terminal failure: the row is permanently Failed/Dead.
    Permanent { error: String },
}

/// Application code plugged into a dispatcher to process one claimed `M`
/// (an `OutboxMessage`, `InboxRecord`, `JobRun`, or `Timer`).
#[async_trait]
pub trait Handler<M>: Send + Sync {
    async fn handle(&self, message: &M) -> HandlerOutcome;
}

/// Adapts a plain async closure into a [`Handler`], for callers who don't
/// need a stateful struct.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<M, F, Fut> Handler<M> for FnHandler<F>
where
    M: Send + Sync,
    F: Fn(&M) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, message: &M) -> HandlerOutcome {
        (self.0)(message).await
    }
}
