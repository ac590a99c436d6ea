//! Initiator side of request/reply.

use super::pending::PendingRequests;
use super::reply_future::ReplyFuture;
use crate::codec::{Decoder, Encoder};
use crate::destination::{CorrelationId, Destination};
use crate::error::{RpcError, StreamError, TransportError};
use crate::message::{IncomingMessage, TransportMessage};
use crate::metrics::MetricsSink;
use crate::multiplexer::{Multiplexer, Subscription};
use crate::transport::TransportAdapter;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Sends requests and correlates the replies that come back.
///
/// Replies are consumed from `reply_destination` through the multiplexer by
/// a background task, so the client shares that connection with any other
/// subscriber of the same destination.
///
/// # Example
///
/// ```rust,ignore
/// let client: RpcClient<String> = RpcClient::start(&multiplexer, "client-7.replies", Utf8Codec);
///
/// match client.send_request("ping", "pinger", Duration::from_millis(100)).await {
///     Ok(reply) => println!("got {}", reply),
///     Err(e) if e.is_timeout() => println!("no answer"),
///     Err(e) => println!("failed: {}", e),
/// }
/// ```
pub struct RpcClient<R> {
    transport: Arc<dyn TransportAdapter>,
    metrics: Arc<dyn MetricsSink>,
    pending: Arc<PendingRequests<R>>,
    decoder: Arc<dyn Decoder<R>>,
    reply_destination: Destination,
    default_timeout: Duration,
    closed: Arc<AtomicBool>,
    runtime: Handle,
    pump: JoinHandle<()>,
}

impl<R: Send + 'static> RpcClient<R> {
    /// Start a client receiving replies on `reply_destination`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(
        multiplexer: &Multiplexer,
        reply_destination: impl Into<Destination>,
        decoder: impl Decoder<R> + 'static,
    ) -> Self {
        let reply_destination = reply_destination.into();
        let metrics = multiplexer.metrics();
        let pending = Arc::new(PendingRequests::new(metrics.clone()));
        let decoder: Arc<dyn Decoder<R>> = Arc::new(decoder);
        let closed = Arc::new(AtomicBool::new(false));
        let runtime = Handle::current();

        let replies = multiplexer.subscribe(
            reply_destination.clone(),
            multiplexer.config().reply_overflow_policy,
        );
        let pump = runtime.spawn(pump_replies(
            replies,
            pending.clone(),
            decoder.clone(),
            metrics.clone(),
            closed.clone(),
        ));

        info!(reply_destination = %reply_destination, "RPC client started");

        Self {
            transport: multiplexer.transport(),
            metrics,
            pending,
            decoder,
            reply_destination,
            default_timeout: multiplexer.config().rpc_timeout,
            closed,
            runtime,
            pump,
        }
    }

    /// Send a request and wait at most `timeout` for its reply.
    ///
    /// Never fails synchronously: a send failure, a correlation-id
    /// collision, or a closed client resolve the returned future with the
    /// matching [`RpcError`] right away, without starting a timer.
    pub fn send_request(
        &self,
        payload: impl Into<Bytes>,
        destination: impl Into<Destination>,
        timeout: Duration,
    ) -> ReplyFuture<R> {
        let destination = destination.into();
        let correlation_id = CorrelationId::generate();

        if self.closed.load(Ordering::Acquire) {
            return ReplyFuture::failed(correlation_id, RpcError::ClientClosed);
        }

        let receiver = match self
            .pending
            .register(correlation_id.clone(), destination.clone(), timeout)
        {
            Ok(receiver) => receiver,
            Err(err) => {
                error!(
                    correlation_id = %correlation_id,
                    destination = %destination,
                    "Correlation id collision, request not sent"
                );
                return ReplyFuture::failed(correlation_id, err);
            }
        };
        let future =
            ReplyFuture::waiting(correlation_id.clone(), receiver, Arc::downgrade(&self.pending));

        let message = TransportMessage::new(payload)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.reply_destination.clone());

        if let Err(err) = self.transport.send(&destination, message) {
            debug!(
                correlation_id = %correlation_id,
                destination = %destination,
                error = %err,
                "Request send failed"
            );
            self.pending.fail(&correlation_id, RpcError::Transport(err));
            return future;
        }

        let registry = Arc::downgrade(&self.pending);
        let id = correlation_id.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pending) = registry.upgrade() {
                pending.expire(&id);
            }
        });
        self.pending.attach_timer(&correlation_id, timer.abort_handle());

        trace!(
            correlation_id = %correlation_id,
            destination = %destination,
            timeout_ms = timeout.as_millis() as u64,
            "Request sent"
        );

        future
    }

    /// Send a request using the configured default timeout.
    pub fn request(
        &self,
        payload: impl Into<Bytes>,
        destination: impl Into<Destination>,
    ) -> ReplyFuture<R> {
        self.send_request(payload, destination, self.default_timeout)
    }

    /// Encode `request` and send it.
    ///
    /// An encoding failure resolves the future with [`RpcError::Encode`].
    pub fn send_encoded<T, E>(
        &self,
        encoder: &E,
        request: &T,
        destination: impl Into<Destination>,
        timeout: Duration,
    ) -> ReplyFuture<R>
    where
        T: ?Sized,
        E: Encoder<T> + ?Sized,
    {
        match encoder.encode(request) {
            Ok(payload) => self.send_request(payload, destination, timeout),
            Err(err) => ReplyFuture::failed(CorrelationId::generate(), RpcError::Encode(err.to_string())),
        }
    }

    /// Route a reply received outside of the client's own subscription.
    ///
    /// Returns `true` if the reply resolved an outstanding request.
    pub fn handle_reply(&self, message: IncomingMessage<Bytes>) -> bool {
        route_reply(&self.pending, self.decoder.as_ref(), self.metrics.as_ref(), message)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Destination this client receives replies on.
    pub fn reply_destination(&self) -> &Destination {
        &self.reply_destination
    }

    /// Check if the client can still send requests.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<R> Drop for RpcClient<R> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.pump.abort();
        let failed = self.pending.fail_all(RpcError::ClientClosed);
        debug!(
            reply_destination = %self.reply_destination,
            failed,
            "RPC client closed"
        );
    }
}

async fn pump_replies<R>(
    mut replies: Subscription,
    pending: Arc<PendingRequests<R>>,
    decoder: Arc<dyn Decoder<R>>,
    metrics: Arc<dyn MetricsSink>,
    closed: Arc<AtomicBool>,
) {
    while let Some(item) = replies.recv().await {
        match item {
            Ok(message) => {
                route_reply(&pending, decoder.as_ref(), metrics.as_ref(), message);
            }
            Err(stream_error) => {
                warn!(
                    destination = %replies.destination(),
                    error = %stream_error,
                    "Reply stream failed, failing outstanding requests"
                );
                closed.store(true, Ordering::Release);
                pending.fail_all(RpcError::Transport(reply_stream_fault(stream_error)));
                return;
            }
        }
    }

    closed.store(true, Ordering::Release);
    let failed = pending.fail_all(RpcError::ClientClosed);
    debug!(
        destination = %replies.destination(),
        failed,
        "Reply stream completed"
    );
}

fn reply_stream_fault(error: StreamError) -> TransportError {
    match error {
        StreamError::ConnectionFault { source, .. } => source,
        overflow @ StreamError::Overflow { .. } => {
            TransportError::connection_lost(overflow.destination(), overflow.to_string())
        }
    }
}

/// Match a reply to its pending request and resolve it.
fn route_reply<R>(
    pending: &PendingRequests<R>,
    decoder: &dyn Decoder<R>,
    metrics: &dyn MetricsSink,
    message: IncomingMessage<Bytes>,
) -> bool {
    let Some(correlation_id) = message.metadata().correlation_id.clone() else {
        trace!(
            destination = %message.destination(),
            "Discarding reply without correlation id"
        );
        return false;
    };

    if let Some(remote) = message.metadata().error() {
        return pending.reject(&correlation_id, RpcError::Remote(remote.to_string()));
    }

    if !pending.contains(&correlation_id) {
        trace!(correlation_id = %correlation_id, "Discarding late or unknown reply");
        return false;
    }

    match decoder.decode(message.payload()) {
        Ok(reply) => pending.resolve(&correlation_id, reply),
        Err(err) => {
            metrics.unparsable_message_received(message.destination());
            debug!(
                correlation_id = %correlation_id,
                destination = %message.destination(),
                error = %err,
                "Dropping unparsable reply"
            );
            false
        }
    }
}
