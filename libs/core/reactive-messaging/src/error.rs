//! Error types for multiplexing, decoding and request/reply correlation.
//!
//! Only two kinds of error are allowed to terminate something:
//!
//! - **ConnectionFault / Overflow** terminate a single subscription stream
//! - **Duplicate registration** fails a setup call
//!
//! Every other error is recovered where it happens and surfaced as data: a
//! metric, a fallback invocation, or a future resolved with an error.

use crate::destination::{CorrelationId, Destination};
use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error reported by a transport adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the connection failed
    #[error("failed to connect to {destination}: {message}")]
    Connect {
        destination: Destination,
        message: String,
    },

    /// Sending a payload failed
    #[error("failed to send to {destination}: {message}")]
    Send {
        destination: Destination,
        message: String,
    },

    /// An open connection was lost
    #[error("connection to {destination} lost: {message}")]
    ConnectionLost {
        destination: Destination,
        message: String,
    },

    /// The adapter has been shut down
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Create a connect error.
    pub fn connect(destination: &Destination, message: impl Into<String>) -> Self {
        Self::Connect {
            destination: destination.clone(),
            message: message.into(),
        }
    }

    /// Create a send error.
    pub fn send(destination: &Destination, message: impl Into<String>) -> Self {
        Self::Send {
            destination: destination.clone(),
            message: message.into(),
        }
    }

    /// Create a connection-lost error.
    pub fn connection_lost(destination: &Destination, message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            destination: destination.clone(),
            message: message.into(),
        }
    }
}

/// A single payload could not be decoded.
///
/// Decode failures are per-message and never terminate a stream.
#[derive(Debug, Error)]
#[error("decode failed: {message}")]
pub struct DecodeError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DecodeError {
    /// Create a decode error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error with a source.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("invalid json", err)
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::with_source("invalid utf-8", err)
    }
}

/// A value could not be encoded for sending.
#[derive(Debug, Error)]
#[error("encode failed: {message}")]
pub struct EncodeError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl EncodeError {
    /// Create an encode error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: "json serialization failed".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Terminal error of a subscription stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The shared connection failed; every subscription of the destination gets this
    #[error("connection fault on {destination}: {source}")]
    ConnectionFault {
        destination: Destination,
        #[source]
        source: TransportError,
    },

    /// The subscription buffer overflowed under the `Fail` policy
    #[error("subscription buffer for {destination} overflowed (capacity {capacity})")]
    Overflow {
        destination: Destination,
        capacity: usize,
    },
}

impl StreamError {
    /// Get the destination the stream belonged to.
    pub fn destination(&self) -> &Destination {
        match self {
            StreamError::ConnectionFault { destination, .. } => destination,
            StreamError::Overflow { destination, .. } => destination,
        }
    }
}

/// Outcome of a failed request on the initiator side.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No reply arrived before the deadline
    #[error("request {correlation_id} to {destination} timed out after {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        destination: Destination,
        timeout: Duration,
    },

    /// The request could not be sent
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The responder completed the request exceptionally
    #[error("remote error: {0}")]
    Remote(String),

    /// The request was cancelled by the initiator
    #[error("request {0} cancelled")]
    Cancelled(CorrelationId),

    /// A generated correlation id was already outstanding
    #[error("correlation id {0} is already outstanding")]
    CorrelationCollision(CorrelationId),

    /// The request could not be encoded
    #[error("request encoding failed: {0}")]
    Encode(String),

    /// The client was dropped before the request resolved
    #[error("rpc client closed")]
    ClientClosed,
}

impl RpcError {
    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

/// Failure to publish a one-way message.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The value could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport rejected the message
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Setup-time handler registration failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// A handler is already registered for the request type
    #[error("a handler is already registered for request type '{request_type}'")]
    Duplicate { request_type: String },
}

/// Failure raised while handling an invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("handler failed: {message}")]
    Failed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The handler panicked
    #[error("handler panicked: {message}")]
    Panicked { message: String },
}

impl HandlerError {
    /// Create a handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler failure with a source.
    pub fn failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a `Panicked` error from a panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::Panicked { message }
    }
}

/// Misuse of an invocation's completion contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// `complete` or `complete_exceptionally` was already called
    #[error("invocation {0} was already completed")]
    AlreadyCompleted(String),
}

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}
