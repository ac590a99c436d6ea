//! A received request together with its single-fire completion.

use crate::destination::{CorrelationId, Destination};
use crate::error::{HandlerError, InvocationError};
use crate::message::MessageMetadata;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

type CompleteFn<Rep> = Box<dyn FnOnce(Rep) + Send>;
type ErrorFn = Box<dyn FnOnce(HandlerError) + Send>;

struct CompletionSinks<Rep> {
    on_complete: CompleteFn<Rep>,
    on_error: ErrorFn,
}

struct InvocationInner<Req, Rep> {
    request: Req,
    request_type: String,
    metadata: MessageMetadata,
    sinks: Mutex<Option<CompletionSinks<Rep>>>,
}

/// One request being handled.
///
/// Exactly one of [`complete`](Self::complete) or
/// [`complete_exceptionally`](Self::complete_exceptionally) takes effect.
/// Any later call sends nothing and returns
/// [`InvocationError::AlreadyCompleted`].
///
/// Cloning is cheap; all clones share the same completion.
pub struct RpcInvocation<Req, Rep> {
    inner: Arc<InvocationInner<Req, Rep>>,
}

impl<Req, Rep> Clone for RpcInvocation<Req, Rep> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Rep> RpcInvocation<Req, Rep> {
    /// Create an invocation with its completion callbacks.
    pub fn new(
        request: Req,
        request_type: impl Into<String>,
        metadata: MessageMetadata,
        on_complete: impl FnOnce(Rep) + Send + 'static,
        on_error: impl FnOnce(HandlerError) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(InvocationInner {
                request,
                request_type: request_type.into(),
                metadata,
                sinks: Mutex::new(Some(CompletionSinks {
                    on_complete: Box::new(on_complete),
                    on_error: Box::new(on_error),
                })),
            }),
        }
    }

    /// Get the decoded request.
    pub fn request(&self) -> &Req {
        &self.inner.request
    }

    /// Get the request type used for handler lookup.
    pub fn request_type(&self) -> &str {
        &self.inner.request_type
    }

    /// Get the metadata of the request message.
    pub fn metadata(&self) -> &MessageMetadata {
        &self.inner.metadata
    }

    /// Get the destination the request arrived on.
    pub fn destination(&self) -> &Destination {
        &self.inner.metadata.destination
    }

    /// Get the correlation id of the request, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.inner.metadata.correlation_id.as_ref()
    }

    /// Get the destination the reply goes to, if any.
    pub fn reply_to(&self) -> Option<&Destination> {
        self.inner.metadata.reply_to.as_ref()
    }

    /// Check if the invocation has been completed.
    pub fn is_completed(&self) -> bool {
        self.inner.sinks.lock().is_none()
    }

    /// Complete with a reply.
    pub fn complete(&self, reply: Rep) -> Result<(), InvocationError> {
        let sinks = self.take_sinks("complete")?;
        (sinks.on_complete)(reply);
        Ok(())
    }

    /// Complete with an error.
    pub fn complete_exceptionally(&self, error: HandlerError) -> Result<(), InvocationError> {
        let sinks = self.take_sinks("complete_exceptionally")?;
        (sinks.on_error)(error);
        Ok(())
    }

    fn take_sinks(&self, operation: &str) -> Result<CompletionSinks<Rep>, InvocationError> {
        // The lock is released before a sink runs.
        let taken = self.inner.sinks.lock().take();
        taken.ok_or_else(|| {
            let id = self.label();
            warn!(
                invocation = %id,
                request_type = %self.inner.request_type,
                operation,
                "Invocation already completed, ignoring"
            );
            InvocationError::AlreadyCompleted(id)
        })
    }

    fn label(&self) -> String {
        match self.correlation_id() {
            Some(id) => id.to_string(),
            None => self.inner.request_type.clone(),
        }
    }
}

impl<Req: fmt::Debug, Rep> fmt::Debug for RpcInvocation<Req, Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcInvocation")
            .field("request_type", &self.inner.request_type)
            .field("request", &self.inner.request)
            .field("correlation_id", &self.correlation_id())
            .field("completed", &self.is_completed())
            .finish()
    }
}
