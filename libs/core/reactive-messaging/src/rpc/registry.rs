//! Typed handler registry and dispatch.
//!
//! Handlers are registered explicitly per request type. Dispatch never
//! fails: a missing handler goes to the unregistered-request fallback, and a
//! handler error or panic goes to the processing-exception handler. Either
//! way the next dispatch proceeds normally.

use super::invocation::RpcInvocation;
use crate::error::{HandlerError, RegistrationError};
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

/// Requests that know which handler they belong to.
///
/// ```rust,ignore
/// #[derive(Deserialize)]
/// #[serde(tag = "type")]
/// enum AccountRequest {
///     Open { owner: String },
///     Close { id: u64 },
/// }
///
/// impl RequestType for AccountRequest {
///     fn request_type(&self) -> &str {
///         match self {
///             AccountRequest::Open { .. } => "Open",
///             AccountRequest::Close { .. } => "Close",
///         }
///     }
/// }
/// ```
pub trait RequestType {
    fn request_type(&self) -> &str;
}

/// Asynchronous request handler.
///
/// The handler must eventually complete the invocation. Returning an error
/// routes it to the processing-exception handler instead.
#[async_trait]
pub trait RequestHandler<Req, Rep>: Send + Sync {
    /// Handle one invocation.
    async fn handle(&self, invocation: RpcInvocation<Req, Rep>) -> Result<(), HandlerError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

type SyncHandlerFn<Req, Rep> =
    dyn Fn(RpcInvocation<Req, Rep>) -> Result<(), HandlerError> + Send + Sync;
type UnregisteredFn<Req, Rep> = dyn Fn(RpcInvocation<Req, Rep>) + Send + Sync;
type ExceptionFn<Req, Rep> = dyn Fn(RpcInvocation<Req, Rep>, HandlerError) + Send + Sync;

enum Handler<Req, Rep> {
    Sync(Arc<SyncHandlerFn<Req, Rep>>),
    Async(Arc<dyn RequestHandler<Req, Rep>>),
}

impl<Req, Rep> Clone for Handler<Req, Rep> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(f.clone()),
            Handler::Async(h) => Handler::Async(h.clone()),
        }
    }
}

struct RegistryInner<Req, Rep> {
    handlers: DashMap<String, Handler<Req, Rep>>,
    on_unregistered: RwLock<Option<Arc<UnregisteredFn<Req, Rep>>>>,
    on_exception: RwLock<Option<Arc<ExceptionFn<Req, Rep>>>>,
    metrics: Arc<dyn MetricsSink>,
}

/// Request-type to handler map with fallback and exception routing.
///
/// Cloning is cheap; clones share the same handlers.
///
/// # Example
///
/// ```rust,ignore
/// let registry: HandlerRegistry<AccountRequest, AccountReply> = HandlerRegistry::new(metrics);
///
/// registry.register("Open", |invocation| {
///     let reply = open_account(invocation.request())?;
///     let _ = invocation.complete(reply);
///     Ok(())
/// })?;
///
/// registry.on_unregistered_request(|invocation| {
///     tracing::warn!(request_type = invocation.request_type(), "unsupported request");
/// });
/// ```
pub struct HandlerRegistry<Req, Rep> {
    inner: Arc<RegistryInner<Req, Rep>>,
}

impl<Req, Rep> Clone for HandlerRegistry<Req, Rep> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Rep> HandlerRegistry<Req, Rep>
where
    Req: Send + Sync + 'static,
    Rep: Send + 'static,
{
    /// Create an empty registry.
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                handlers: DashMap::new(),
                on_unregistered: RwLock::new(None),
                on_exception: RwLock::new(None),
                metrics,
            }),
        }
    }

    /// Register a synchronous handler for `request_type`.
    ///
    /// Fails with [`RegistrationError::Duplicate`] if the type already has
    /// a handler; the existing handler stays active.
    pub fn register<F>(&self, request_type: impl Into<String>, handler: F) -> Result<(), RegistrationError>
    where
        F: Fn(RpcInvocation<Req, Rep>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(request_type.into(), Handler::Sync(Arc::new(handler)))
    }

    /// Register an asynchronous handler for `request_type`.
    ///
    /// The handler runs on its own task, so a slow handler never holds up
    /// dispatch of other requests.
    pub fn register_handler<H>(&self, request_type: impl Into<String>, handler: H) -> Result<(), RegistrationError>
    where
        H: RequestHandler<Req, Rep> + 'static,
    {
        self.insert(request_type.into(), Handler::Async(Arc::new(handler)))
    }

    fn insert(&self, request_type: String, handler: Handler<Req, Rep>) -> Result<(), RegistrationError> {
        match self.inner.handlers.entry(request_type) {
            Entry::Occupied(entry) => Err(RegistrationError::Duplicate {
                request_type: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                debug!(request_type = %entry.key(), "Registered request handler");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Set the handler for requests whose type has no registered handler.
    ///
    /// Without one, such requests are counted and logged, and the
    /// invocation is left unresolved.
    pub fn on_unregistered_request<F>(&self, fallback: F)
    where
        F: Fn(RpcInvocation<Req, Rep>) + Send + Sync + 'static,
    {
        *self.inner.on_unregistered.write() = Some(Arc::new(fallback));
    }

    /// Set the handler for errors and panics raised by request handlers.
    ///
    /// Without one, the failure is logged and the invocation is left as the
    /// handler left it. An unresolved invocation surfaces as a timeout on
    /// the initiator.
    pub fn on_processing_exception<F>(&self, handler: F)
    where
        F: Fn(RpcInvocation<Req, Rep>, HandlerError) + Send + Sync + 'static,
    {
        *self.inner.on_exception.write() = Some(Arc::new(handler));
    }

    /// Check if `request_type` has a handler.
    pub fn is_registered(&self, request_type: &str) -> bool {
        self.inner.handlers.contains_key(request_type)
    }

    /// Get the registered request types, sorted.
    pub fn request_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Check if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.handlers.is_empty()
    }

    /// Route an invocation to the handler for its request type.
    ///
    /// Never fails and never panics. Synchronous handlers run before this
    /// returns; asynchronous handlers are spawned on the current tokio
    /// runtime.
    pub fn dispatch(&self, invocation: RpcInvocation<Req, Rep>) {
        let handler = self
            .inner
            .handlers
            .get(invocation.request_type())
            .map(|entry| entry.value().clone());

        match handler {
            None => self.inner.handle_unregistered(invocation),
            Some(Handler::Sync(handler)) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(invocation.clone())));
                self.inner.settle(invocation, outcome);
            }
            Some(Handler::Async(handler)) => match Handle::try_current() {
                Ok(runtime) => {
                    let inner = self.inner.clone();
                    runtime.spawn(async move {
                        let outcome = AssertUnwindSafe(handler.handle(invocation.clone()))
                            .catch_unwind()
                            .await;
                        inner.settle(invocation, outcome);
                    });
                }
                Err(_) => self.inner.handle_exception(
                    invocation,
                    HandlerError::failed("no tokio runtime available for async handler"),
                ),
            },
        }
    }
}

impl<Req, Rep> RegistryInner<Req, Rep> {
    fn settle(
        &self,
        invocation: RpcInvocation<Req, Rep>,
        outcome: Result<Result<(), HandlerError>, Box<dyn Any + Send>>,
    ) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.handle_exception(invocation, err),
            Err(panic) => {
                let err = HandlerError::from_panic(panic);
                error!(
                    request_type = %invocation.request_type(),
                    error = %err,
                    "Request handler panicked"
                );
                self.handle_exception(invocation, err);
            }
        }
    }

    fn handle_unregistered(&self, invocation: RpcInvocation<Req, Rep>) {
        self.metrics.unregistered_request(invocation.destination());

        let fallback = self.on_unregistered.read().clone();
        match fallback {
            Some(fallback) => {
                if panic::catch_unwind(AssertUnwindSafe(|| fallback(invocation.clone()))).is_err() {
                    error!(
                        request_type = %invocation.request_type(),
                        "Unregistered-request handler panicked"
                    );
                }
            }
            None => {
                warn!(
                    request_type = %invocation.request_type(),
                    destination = %invocation.destination(),
                    "No handler registered for request type"
                );
            }
        }
    }

    fn handle_exception(&self, invocation: RpcInvocation<Req, Rep>, err: HandlerError) {
        let handler = self.on_exception.read().clone();
        match handler {
            Some(handler) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(invocation.clone(), err))).is_err() {
                    error!(
                        request_type = %invocation.request_type(),
                        "Processing-exception handler panicked"
                    );
                }
            }
            None => {
                warn!(
                    request_type = %invocation.request_type(),
                    error = %err,
                    "Request handler failed"
                );
            }
        }
    }
}
