//! Message types exchanged with transport adapters and consumers.

use crate::destination::{CorrelationId, Destination};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Header set on a reply that carries an error instead of a result.
///
/// The header value is the error message; the payload is empty.
pub const ERROR_HEADER: &str = "error";

/// A raw message as seen by a transport adapter, in either direction.
///
/// Inbound, the adapter hands it to an [`InboundSink`](crate::InboundSink);
/// outbound, the core hands it to
/// [`TransportAdapter::send`](crate::TransportAdapter::send).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportMessage {
    /// Encoded payload.
    pub payload: Bytes,

    /// Correlation id for request/reply traffic.
    pub correlation_id: Option<CorrelationId>,

    /// Where replies to this message should be sent.
    pub reply_to: Option<Destination>,

    /// Transport-specific string headers.
    pub headers: BTreeMap<String, String>,
}

impl TransportMessage {
    /// Create a message with the given payload and no metadata.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the reply-to destination.
    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get the error carried by this message, if it is an error reply.
    pub fn error(&self) -> Option<&str> {
        self.headers.get(ERROR_HEADER).map(String::as_str)
    }
}

/// Metadata attached to every message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMetadata {
    /// Destination the message was received from.
    pub destination: Destination,

    /// Correlation id, if the transport carried one.
    pub correlation_id: Option<CorrelationId>,

    /// Reply-to destination, if the transport carried one.
    pub reply_to: Option<Destination>,

    /// Transport-specific headers.
    pub headers: BTreeMap<String, String>,

    /// When the multiplexer received the message from the connection.
    pub received_at: DateTime<Utc>,
}

impl MessageMetadata {
    /// Metadata for a message received now from `destination`.
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            correlation_id: None,
            reply_to: None,
            headers: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    /// Get a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Get the error carried by this message, if it is an error reply.
    pub fn error(&self) -> Option<&str> {
        self.header(ERROR_HEADER)
    }
}

/// An immutable pair of payload and metadata, as delivered to subscribers.
///
/// Subscriptions yield `IncomingMessage<Bytes>`; the decode stage turns them
/// into `IncomingMessage<T>`.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage<T> {
    payload: T,
    metadata: MessageMetadata,
}

impl<T> IncomingMessage<T> {
    /// Create a new incoming message.
    pub fn new(payload: T, metadata: MessageMetadata) -> Self {
        Self { payload, metadata }
    }

    /// Get the payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Get the metadata.
    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Get the destination the message was received from.
    pub fn destination(&self) -> &Destination {
        &self.metadata.destination
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Split into payload and metadata.
    pub fn into_parts(self) -> (T, MessageMetadata) {
        (self.payload, self.metadata)
    }

    /// Replace the payload, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> IncomingMessage<U> {
        IncomingMessage {
            payload: f(self.payload),
            metadata: self.metadata,
        }
    }
}

impl IncomingMessage<Bytes> {
    /// Build an incoming message from what a transport received on `destination`.
    pub fn from_transport(destination: Destination, message: TransportMessage) -> Self {
        let metadata = MessageMetadata {
            destination,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            headers: message.headers,
            received_at: Utc::now(),
        };
        Self::new(message.payload, metadata)
    }
}
