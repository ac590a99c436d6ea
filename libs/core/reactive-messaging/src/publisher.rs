//! Fire-and-forget publishing.

use crate::codec::Encoder;
use crate::destination::Destination;
use crate::error::PublishError;
use crate::message::TransportMessage;
use crate::transport::TransportAdapter;
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Publishes one-way messages through the transport.
///
/// # Example
///
/// ```rust,ignore
/// let publisher = multiplexer.publisher(JsonCodec);
/// publisher.publish(&Destination::new("quotes"), &quote)?;
/// ```
pub struct Publisher<E> {
    transport: Arc<dyn TransportAdapter>,
    encoder: E,
}

impl<E> Publisher<E> {
    /// Create a publisher over `transport`.
    pub fn new(transport: Arc<dyn TransportAdapter>, encoder: E) -> Self {
        Self { transport, encoder }
    }

    /// Encode `value` and send it to `destination`.
    pub fn publish<T>(&self, destination: &Destination, value: &T) -> Result<(), PublishError>
    where
        T: ?Sized,
        E: Encoder<T>,
    {
        let payload = self.encoder.encode(value)?;
        self.publish_raw(destination, TransportMessage::new(payload))
    }

    /// Send an already encoded payload.
    pub fn publish_bytes(&self, destination: &Destination, payload: Bytes) -> Result<(), PublishError> {
        self.publish_raw(destination, TransportMessage::new(payload))
    }

    /// Send a prepared transport message.
    pub fn publish_raw(
        &self,
        destination: &Destination,
        message: TransportMessage,
    ) -> Result<(), PublishError> {
        let len = message.payload.len();
        self.transport.send(destination, message)?;
        trace!(destination = %destination, payload_len = len, "Published message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::error::{EncodeError, TransportError};
    use crate::multiplexer::InboundSink;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct SendLog {
        sent: Mutex<Vec<(Destination, Bytes)>>,
    }

    impl TransportAdapter for SendLog {
        fn connect(&self, _destination: &Destination, _inbound: InboundSink) -> Result<(), TransportError> {
            Ok(())
        }

        fn disconnect(&self, _destination: &Destination) {}

        fn send(&self, destination: &Destination, message: TransportMessage) -> Result<(), TransportError> {
            if destination.as_str() == "closed" {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push((destination.clone(), message.payload));
            Ok(())
        }
    }

    struct Refuse;

    impl Encoder<u32> for Refuse {
        fn encode(&self, _value: &u32) -> Result<Bytes, EncodeError> {
            Err(EncodeError::new("refused"))
        }
    }

    #[test]
    fn test_publish_encodes_and_sends() {
        let log = Arc::new(SendLog::default());
        let publisher = Publisher::new(log.clone(), JsonCodec);

        publisher
            .publish(&Destination::new("quotes"), &serde_json::json!({"price": 3}))
            .unwrap();

        let sent = log.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_str(), "quotes");
        assert_eq!(sent[0].1.as_ref(), br#"{"price":3}"#);
    }

    #[test]
    fn test_publish_errors_are_returned() {
        let log = Arc::new(SendLog::default());

        let publisher = Publisher::new(log.clone(), JsonCodec);
        let err = publisher
            .publish(&Destination::new("closed"), "hello")
            .unwrap_err();
        assert!(matches!(err, PublishError::Transport(TransportError::Closed)));

        let publisher = Publisher::new(log.clone(), Refuse);
        let err = publisher.publish(&Destination::new("quotes"), &1u32).unwrap_err();
        assert!(matches!(err, PublishError::Encode(_)));
        assert!(log.sent.lock().is_empty());
    }
}
