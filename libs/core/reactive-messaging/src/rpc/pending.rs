//! Registry of requests awaiting a reply.
//!
//! Every way a request can finish (reply, error reply, timeout, send failure,
//! cancellation, client shutdown) goes through [`PendingRequests::take`].
//! Removal from the map is the single synchronization point: whoever removes
//! the entry resolves it, and everyone else finds nothing and does nothing.

use crate::destination::{CorrelationId, Destination};
use crate::error::RpcError;
use crate::metrics::MetricsSink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::trace;

type ReplySlot<R> = oneshot::Sender<Result<R, RpcError>>;

/// A request awaiting its reply.
struct PendingRequest<R> {
    destination: Destination,
    created_at: Instant,
    timeout: Duration,
    slot: ReplySlot<R>,
    timer: Option<AbortHandle>,
}

impl<R> PendingRequest<R> {
    fn settle(self, outcome: Result<R, RpcError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The receiver may already be gone (future dropped); nothing to do then.
        let _ = self.slot.send(outcome);
    }
}

/// Outstanding requests keyed by correlation id.
pub struct PendingRequests<R> {
    entries: DashMap<CorrelationId, PendingRequest<R>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<R> PendingRequests<R> {
    /// Create an empty registry.
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            entries: DashMap::new(),
            metrics,
        }
    }

    /// Register a request and get the receiving end of its reply slot.
    ///
    /// Fails with [`RpcError::CorrelationCollision`] if `id` is already
    /// outstanding; the existing request is left untouched.
    pub fn register(
        &self,
        id: CorrelationId,
        destination: Destination,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<R, RpcError>>, RpcError> {
        match self.entries.entry(id) {
            Entry::Occupied(entry) => Err(RpcError::CorrelationCollision(entry.key().clone())),
            Entry::Vacant(entry) => {
                let (slot, receiver) = oneshot::channel();
                entry.insert(PendingRequest {
                    destination,
                    created_at: Instant::now(),
                    timeout,
                    slot,
                    timer: None,
                });
                Ok(receiver)
            }
        }
    }

    /// Attach the timeout task of a request.
    ///
    /// If the request already finished the task is aborted right away.
    pub(crate) fn attach_timer(&self, id: &CorrelationId, timer: AbortHandle) {
        match self.entries.get_mut(id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    fn take(&self, id: &CorrelationId) -> Option<PendingRequest<R>> {
        self.entries.remove(id).map(|(_, pending)| pending)
    }

    /// Resolve a request with its reply.
    ///
    /// Returns `false` if the request is unknown or already finished; such
    /// late replies are discarded.
    pub fn resolve(&self, id: &CorrelationId, reply: R) -> bool {
        self.finish_with_reply(id, Ok(reply))
    }

    /// Resolve a request with an error reply from the responder.
    pub fn reject(&self, id: &CorrelationId, error: RpcError) -> bool {
        self.finish_with_reply(id, Err(error))
    }

    fn finish_with_reply(&self, id: &CorrelationId, outcome: Result<R, RpcError>) -> bool {
        match self.take(id) {
            Some(pending) => {
                self.metrics
                    .rpc_completed(&pending.destination, pending.created_at.elapsed());
                pending.settle(outcome);
                true
            }
            None => {
                trace!(correlation_id = %id, "Discarding reply for unknown or finished request");
                false
            }
        }
    }

    /// Resolve a request with a timeout error.
    pub fn expire(&self, id: &CorrelationId) -> bool {
        match self.take(id) {
            Some(pending) => {
                let elapsed = pending.created_at.elapsed();
                self.metrics.rpc_timed_out(&pending.destination, elapsed);
                trace!(
                    correlation_id = %id,
                    destination = %pending.destination,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request timed out"
                );
                let error = RpcError::Timeout {
                    correlation_id: id.clone(),
                    destination: pending.destination.clone(),
                    timeout: pending.timeout,
                };
                pending.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolve a request with a local failure (e.g. the send failed).
    pub fn fail(&self, id: &CorrelationId, error: RpcError) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Withdraw a request; its future resolves with [`RpcError::Cancelled`].
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.fail(id, RpcError::Cancelled(id.clone()))
    }

    /// Fail every outstanding request with a copy of `error`.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.fail(id, error.clone()))
            .count()
    }

    /// Check if a request is outstanding.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<R> fmt::Debug for PendingRequests<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("outstanding", &self.entries.len())
            .finish()
    }
}
