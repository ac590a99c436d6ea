//! Transport adapter seam.
//!
//! Adapters own the protocol (TCP, AMQP, HTTP, ...). The core only asks them
//! to open and close one connection per destination and to send messages.

use crate::destination::Destination;
use crate::error::TransportError;
use crate::message::TransportMessage;
use crate::multiplexer::InboundSink;
use std::sync::Arc;

/// A transport integration supplied by the surrounding code.
///
/// # Contract
///
/// - `connect` and `disconnect` are called by the [`Multiplexer`](crate::Multiplexer)
///   inside its per-destination critical section. They must only *initiate*
///   the work (spawn a reader, register a consumer) and return promptly.
/// - Inbound payloads and connection loss are reported through the
///   [`InboundSink`] handed to `connect`. The sink must not be called from
///   inside `connect` or `disconnect`, nor while holding a lock that
///   `disconnect` also takes.
/// - `send` must not wait for a reply. A returned error is a synchronous send
///   failure; anything else is treated as accepted.
///
/// # Example
///
/// ```rust,ignore
/// struct QueueAdapter { client: QueueClient }
///
/// impl TransportAdapter for QueueAdapter {
///     fn connect(&self, destination: &Destination, inbound: InboundSink) -> Result<(), TransportError> {
///         let consumer = self.client.consume(destination.as_str())
///             .map_err(|e| TransportError::connect(destination, e.to_string()))?;
///         tokio::spawn(async move {
///             while let Some(delivery) = consumer.next().await {
///                 match delivery {
///                     Ok(d) => inbound.deliver(TransportMessage::new(d.body)),
///                     Err(e) => return inbound.fail(TransportError::connection_lost(inbound.destination(), e.to_string())),
///                 }
///             }
///         });
///         Ok(())
///     }
///
///     fn disconnect(&self, destination: &Destination) {
///         self.client.cancel(destination.as_str());
///     }
///
///     fn send(&self, destination: &Destination, message: TransportMessage) -> Result<(), TransportError> {
///         self.client.publish(destination.as_str(), message.payload)
///             .map_err(|e| TransportError::send(destination, e.to_string()))
///     }
/// }
/// ```
pub trait TransportAdapter: Send + Sync + 'static {
    /// Open the connection for `destination`, delivering into `inbound`.
    fn connect(&self, destination: &Destination, inbound: InboundSink) -> Result<(), TransportError>;

    /// Close the connection for `destination`.
    fn disconnect(&self, destination: &Destination);

    /// Send a message to `destination`.
    fn send(&self, destination: &Destination, message: TransportMessage) -> Result<(), TransportError>;
}

impl<T: TransportAdapter + ?Sized> TransportAdapter for Arc<T> {
    fn connect(&self, destination: &Destination, inbound: InboundSink) -> Result<(), TransportError> {
        (**self).connect(destination, inbound)
    }

    fn disconnect(&self, destination: &Destination) {
        (**self).disconnect(destination)
    }

    fn send(&self, destination: &Destination, message: TransportMessage) -> Result<(), TransportError> {
        (**self).send(destination, message)
    }
}
