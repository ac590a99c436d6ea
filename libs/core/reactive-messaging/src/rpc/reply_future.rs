//! Future returned by [`RpcClient::send_request`](crate::RpcClient::send_request).

use super::pending::PendingRequests;
use crate::destination::CorrelationId;
use crate::error::RpcError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

enum ReplyState<R> {
    Waiting {
        receiver: oneshot::Receiver<Result<R, RpcError>>,
        pending: Weak<PendingRequests<R>>,
    },
    Ready(RpcError),
    Done,
}

/// Resolves exactly once with the reply or with an [`RpcError`].
///
/// Dropping the future before it resolves cancels the request: its pending
/// entry and timer are removed, and a reply arriving later is discarded.
#[must_use = "dropping a ReplyFuture cancels the request"]
pub struct ReplyFuture<R> {
    correlation_id: CorrelationId,
    state: ReplyState<R>,
}

impl<R> Unpin for ReplyFuture<R> {}

impl<R> ReplyFuture<R> {
    pub(crate) fn waiting(
        correlation_id: CorrelationId,
        receiver: oneshot::Receiver<Result<R, RpcError>>,
        pending: Weak<PendingRequests<R>>,
    ) -> Self {
        Self {
            correlation_id,
            state: ReplyState::Waiting { receiver, pending },
        }
    }

    /// A future that fails immediately, without a pending entry.
    pub(crate) fn failed(correlation_id: CorrelationId, error: RpcError) -> Self {
        Self {
            correlation_id,
            state: ReplyState::Ready(error),
        }
    }

    /// Get the correlation id of the request.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Cancel the request.
    ///
    /// Returns `true` if the request was still outstanding.
    pub fn cancel(mut self) -> bool {
        self.withdraw()
    }

    fn withdraw(&mut self) -> bool {
        match std::mem::replace(&mut self.state, ReplyState::Done) {
            ReplyState::Waiting { pending, .. } => {
                let cancelled = pending
                    .upgrade()
                    .map(|pending| pending.cancel(&self.correlation_id))
                    .unwrap_or(false);
                if cancelled {
                    trace!(correlation_id = %self.correlation_id, "Request cancelled");
                }
                cancelled
            }
            _ => false,
        }
    }
}

impl<R> Future for ReplyFuture<R> {
    type Output = Result<R, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let ReplyState::Waiting { receiver, .. } = &mut this.state {
            let outcome = match Pin::new(receiver).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(outcome)) => outcome,
                // The registry went away without settling the request.
                Poll::Ready(Err(_)) => Err(RpcError::ClientClosed),
            };
            this.state = ReplyState::Done;
            return Poll::Ready(outcome);
        }

        match std::mem::replace(&mut this.state, ReplyState::Done) {
            ReplyState::Ready(error) => Poll::Ready(Err(error)),
            _ => panic!("ReplyFuture polled after completion"),
        }
    }
}

impl<R> Drop for ReplyFuture<R> {
    fn drop(&mut self) {
        self.withdraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::metrics::NoopMetrics;
    use std::sync::Arc;
    use std::time::Duration;

    fn pending() -> Arc<PendingRequests<u32>> {
        Arc::new(PendingRequests::new(Arc::new(NoopMetrics)))
    }

    #[tokio::test]
    async fn test_resolves_with_reply() {
        let pending = pending();
        let id = CorrelationId::from("r-1");
        let rx = pending
            .register(id.clone(), Destination::new("svc"), Duration::from_secs(1))
            .unwrap();
        let future = ReplyFuture::waiting(id.clone(), rx, Arc::downgrade(&pending));

        pending.resolve(&id, 7);
        assert_eq!(future.await, Ok(7));
    }

    #[tokio::test]
    async fn test_failed_future() {
        let future: ReplyFuture<u32> =
            ReplyFuture::failed(CorrelationId::from("x"), RpcError::ClientClosed);
        assert_eq!(future.await, Err(RpcError::ClientClosed));
    }

    #[test]
    fn test_drop_cancels_pending_entry() {
        let pending = pending();
        let id = CorrelationId::from("r-2");
        let rx = pending
            .register(id.clone(), Destination::new("svc"), Duration::from_secs(1))
            .unwrap();
        let future = ReplyFuture::waiting(id.clone(), rx, Arc::downgrade(&pending));

        drop(future);
        assert!(!pending.contains(&id));
    }

    #[test]
    fn test_cancel_reports_whether_outstanding() {
        let pending = pending();
        let id = CorrelationId::from("r-3");
        let rx = pending
            .register(id.clone(), Destination::new("svc"), Duration::from_secs(1))
            .unwrap();
        let future = ReplyFuture::waiting(id.clone(), rx, Arc::downgrade(&pending));
        assert!(future.cancel());

        let rx = pending
            .register(id.clone(), Destination::new("svc"), Duration::from_secs(1))
            .unwrap();
        let future = ReplyFuture::waiting(id.clone(), rx, Arc::downgrade(&pending));
        pending.expire(&id);
        assert!(!future.cancel());
    }

    #[tokio::test]
    async fn test_registry_dropped_resolves_client_closed() {
        let pending = pending();
        let id = CorrelationId::from("r-4");
        let rx = pending
            .register(id.clone(), Destination::new("svc"), Duration::from_secs(1))
            .unwrap();
        let future = ReplyFuture::waiting(id, rx, Arc::downgrade(&pending));

        drop(pending);
        assert_eq!(future.await, Err(RpcError::ClientClosed));
    }
}
