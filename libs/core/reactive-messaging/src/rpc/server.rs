//! Responder side of request/reply.

use super::invocation::RpcInvocation;
use super::registry::{HandlerRegistry, RequestHandler, RequestType};
use crate::codec::{decode_stage, Decoder, Encoder};
use crate::destination::{CorrelationId, Destination};
use crate::error::{HandlerError, RegistrationError, StreamError};
use crate::message::{IncomingMessage, TransportMessage, ERROR_HEADER};
use crate::metrics::MetricsSink;
use crate::multiplexer::Multiplexer;
use crate::transport::TransportAdapter;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Receives requests on one destination and dispatches them to handlers.
///
/// # Example
///
/// ```rust,ignore
/// let server: RpcServer<AccountRequest, AccountReply> =
///     RpcServer::new(&multiplexer, "accounts", JsonCodec, JsonCodec);
///
/// server.register("Open", |invocation| {
///     let _ = invocation.complete(AccountReply::Opened);
///     Ok(())
/// })?;
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// server.run(shutdown_rx).await?;
/// ```
pub struct RpcServer<Req, Rep> {
    multiplexer: Multiplexer,
    request_destination: Destination,
    registry: HandlerRegistry<Req, Rep>,
    decoder: Arc<dyn Decoder<Req>>,
    encoder: Arc<dyn Encoder<Rep>>,
}

impl<Req, Rep> RpcServer<Req, Rep>
where
    Req: RequestType + Send + Sync + 'static,
    Rep: Send + 'static,
{
    /// Create a server for `request_destination`.
    pub fn new(
        multiplexer: &Multiplexer,
        request_destination: impl Into<Destination>,
        decoder: impl Decoder<Req> + 'static,
        encoder: impl Encoder<Rep> + 'static,
    ) -> Self {
        Self {
            multiplexer: multiplexer.clone(),
            request_destination: request_destination.into(),
            registry: HandlerRegistry::new(multiplexer.metrics()),
            decoder: Arc::new(decoder),
            encoder: Arc::new(encoder),
        }
    }

    /// Get the handler registry.
    pub fn registry(&self) -> &HandlerRegistry<Req, Rep> {
        &self.registry
    }

    /// Get the destination requests are received on.
    pub fn request_destination(&self) -> &Destination {
        &self.request_destination
    }

    /// Register a synchronous handler. See [`HandlerRegistry::register`].
    pub fn register<F>(&self, request_type: impl Into<String>, handler: F) -> Result<(), RegistrationError>
    where
        F: Fn(RpcInvocation<Req, Rep>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.register(request_type, handler)
    }

    /// Register an asynchronous handler. See [`HandlerRegistry::register_handler`].
    pub fn register_handler<H>(&self, request_type: impl Into<String>, handler: H) -> Result<(), RegistrationError>
    where
        H: RequestHandler<Req, Rep> + 'static,
    {
        self.registry.register_handler(request_type, handler)
    }

    /// Set the unregistered-request fallback.
    pub fn on_unregistered_request<F>(&self, fallback: F)
    where
        F: Fn(RpcInvocation<Req, Rep>) + Send + Sync + 'static,
    {
        self.registry.on_unregistered_request(fallback)
    }

    /// Set the processing-exception handler.
    pub fn on_processing_exception<F>(&self, handler: F)
    where
        F: Fn(RpcInvocation<Req, Rep>, HandlerError) + Send + Sync + 'static,
    {
        self.registry.on_processing_exception(handler)
    }

    /// Consume requests until shutdown is signalled.
    ///
    /// Returns an error only if the request stream itself fails (connection
    /// fault or overflow). Malformed requests and failing handlers are
    /// handled per message and never stop the loop.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), StreamError> {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let mut requests = self.multiplexer.subscribe(
            self.request_destination.clone(),
            self.multiplexer.config().reply_overflow_policy,
        );

        info!(
            destination = %self.request_destination,
            handlers = self.registry.len(),
            "RPC server started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Received shutdown signal, stopping RPC server");
                        break;
                    }
                }

                next = requests.recv() => match next {
                    Some(Ok(message)) => self.handle_request(message),
                    Some(Err(err)) => {
                        warn!(
                            destination = %self.request_destination,
                            error = %err,
                            "Request stream failed, stopping RPC server"
                        );
                        return Err(err);
                    }
                    None => {
                        info!(destination = %self.request_destination, "Request stream completed");
                        break;
                    }
                },
            }
        }

        requests.unsubscribe();
        info!(destination = %self.request_destination, "RPC server stopped");
        Ok(())
    }

    /// Decode one request message and dispatch it.
    ///
    /// Exposed for adapters that deliver requests directly instead of
    /// through [`run`](Self::run).
    pub fn handle_request(&self, message: IncomingMessage<Bytes>) {
        let metrics = self.multiplexer.metrics();
        let Some(decoded) = decode_stage(self.decoder.as_ref(), message, metrics.as_ref()) else {
            return;
        };

        let (request, metadata) = decoded.into_parts();
        metrics.request_received(&metadata.destination);

        let route = Arc::new(ReplyRoute {
            transport: self.multiplexer.transport(),
            metrics,
            origin: metadata.destination.clone(),
            reply_to: metadata.reply_to.clone(),
            correlation_id: metadata.correlation_id.clone(),
        });
        let encoder = self.encoder.clone();
        let on_complete = {
            let route = route.clone();
            move |reply: Rep| match encoder.encode(&reply) {
                Ok(payload) => route.send_reply(payload),
                Err(err) => {
                    warn!(
                        destination = %route.origin,
                        error = %err,
                        "Failed to encode reply, sending error reply instead"
                    );
                    route.send_error(&err.to_string());
                }
            }
        };
        let on_error = move |err: HandlerError| route.send_error(&err.to_string());

        let request_type = request.request_type().to_string();
        let invocation = RpcInvocation::new(request, request_type, metadata, on_complete, on_error);
        self.registry.dispatch(invocation);
    }
}

/// Where a reply for one request goes.
struct ReplyRoute {
    transport: Arc<dyn TransportAdapter>,
    metrics: Arc<dyn MetricsSink>,
    origin: Destination,
    reply_to: Option<Destination>,
    correlation_id: Option<CorrelationId>,
}

impl ReplyRoute {
    fn send_reply(&self, payload: Bytes) {
        self.metrics.request_completed(&self.origin);
        self.send(TransportMessage::new(payload));
    }

    fn send_error(&self, message: &str) {
        self.metrics.request_completed_exceptionally(&self.origin);
        self.send(TransportMessage::default().with_header(ERROR_HEADER, message));
    }

    fn send(&self, mut message: TransportMessage) {
        let Some(reply_to) = &self.reply_to else {
            debug!(destination = %self.origin, "Request has no reply-to, reply not sent");
            return;
        };
        if let Some(id) = &self.correlation_id {
            message = message.with_correlation_id(id.clone());
        }
        if let Err(err) = self.transport.send(reply_to, message) {
            warn!(
                destination = %self.origin,
                reply_to = %reply_to,
                error = %err,
                "Failed to send reply"
            );
        }
    }
}
