//! Payload codecs and the decode stage.
//!
//! A [`Decoder`] turns raw payload bytes into a typed value; an [`Encoder`]
//! does the reverse for outbound messages. The decode stage drops payloads
//! that fail to decode instead of failing the stream they arrived on.

use crate::error::{DecodeError, EncodeError};
use crate::message::IncomingMessage;
use crate::metrics::MetricsSink;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Turns payload bytes into a `T`.
pub trait Decoder<T>: Send + Sync {
    fn decode(&self, payload: &Bytes) -> Result<T, DecodeError>;
}

/// Turns a `T` into payload bytes.
pub trait Encoder<T: ?Sized>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes, EncodeError>;
}

impl<T, D: Decoder<T> + ?Sized> Decoder<T> for Arc<D> {
    fn decode(&self, payload: &Bytes) -> Result<T, DecodeError> {
        (**self).decode(payload)
    }
}

impl<T: ?Sized, E: Encoder<T> + ?Sized> Encoder<T> for Arc<E> {
    fn encode(&self, value: &T) -> Result<Bytes, EncodeError> {
        (**self).encode(value)
    }
}

/// JSON codec for any serde type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: DeserializeOwned> Decoder<T> for JsonCodec {
    fn decode(&self, payload: &Bytes) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl<T: Serialize + ?Sized> Encoder<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Bytes, EncodeError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

/// UTF-8 text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Decoder<String> for Utf8Codec {
    fn decode(&self, payload: &Bytes) -> Result<String, DecodeError> {
        Ok(std::str::from_utf8(payload)?.to_owned())
    }
}

impl Encoder<str> for Utf8Codec {
    fn encode(&self, value: &str) -> Result<Bytes, EncodeError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl Encoder<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Result<Bytes, EncodeError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// Pass-through codec for raw payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Decoder<Bytes> for BytesCodec {
    fn decode(&self, payload: &Bytes) -> Result<Bytes, DecodeError> {
        Ok(payload.clone())
    }
}

impl Encoder<Bytes> for BytesCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, EncodeError> {
        Ok(value.clone())
    }
}

impl Encoder<[u8]> for BytesCodec {
    fn encode(&self, value: &[u8]) -> Result<Bytes, EncodeError> {
        Ok(Bytes::copy_from_slice(value))
    }
}

/// Decoder built from a closure.
///
/// ```rust,ignore
/// let decoder = FnDecoder::new(|payload: &Bytes| {
///     payload.first().copied().ok_or_else(|| DecodeError::new("empty payload"))
/// });
/// ```
#[derive(Clone)]
pub struct FnDecoder<F>(F);

impl<F> FnDecoder<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<T, F> Decoder<T> for FnDecoder<F>
where
    F: Fn(&Bytes) -> Result<T, DecodeError> + Send + Sync,
{
    fn decode(&self, payload: &Bytes) -> Result<T, DecodeError> {
        (self.0)(payload)
    }
}

/// Decode one message, or drop it.
///
/// On failure the payload is counted with
/// [`MetricsSink::unparsable_message_received`] and `None` is returned, so
/// the caller simply moves on to the next message.
pub fn decode_stage<T, D>(
    decoder: &D,
    message: IncomingMessage<Bytes>,
    metrics: &dyn MetricsSink,
) -> Option<IncomingMessage<T>>
where
    D: Decoder<T> + ?Sized,
{
    match decoder.decode(message.payload()) {
        Ok(value) => Some(message.map(|_| value)),
        Err(error) => {
            metrics.unparsable_message_received(message.destination());
            debug!(
                destination = %message.destination(),
                error = %error,
                payload_len = message.payload().len(),
                "Dropping unparsable message"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::message::MessageMetadata;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
        price: u32,
    }

    #[derive(Default)]
    struct CountingMetrics {
        unparsable: AtomicUsize,
    }

    impl MetricsSink for CountingMetrics {
        fn unparsable_message_received(&self, _destination: &Destination) {
            self.unparsable.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn raw(payload: &'static str) -> IncomingMessage<Bytes> {
        IncomingMessage::new(
            Bytes::from_static(payload.as_bytes()),
            MessageMetadata::new(Destination::new("quotes")),
        )
    }

    #[test]
    fn test_json_codec_decodes_and_encodes() {
        let quote: Quote = JsonCodec
            .decode(&Bytes::from_static(br#"{"symbol":"ACME","price":12}"#))
            .unwrap();
        assert_eq!(
            quote,
            Quote {
                symbol: "ACME".to_string(),
                price: 12
            }
        );

        let bytes = JsonCodec.encode(&quote).unwrap();
        let again: Quote = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(again, quote);
    }

    #[test]
    fn test_utf8_codec_rejects_invalid_bytes() {
        let err = Utf8Codec
            .decode(&Bytes::from_static(&[0xff, 0xfe]))
            .unwrap_err();
        assert_eq!(err.message(), "invalid utf-8");
    }

    #[test]
    fn test_decode_stage_keeps_metadata() {
        let metrics = CountingMetrics::default();
        let decoded = decode_stage(&Utf8Codec, raw("hello"), &metrics).unwrap();
        assert_eq!(decoded.payload(), "hello");
        assert_eq!(decoded.destination().as_str(), "quotes");
        assert_eq!(metrics.unparsable.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_stage_drops_malformed_payload_once() {
        let metrics = CountingMetrics::default();
        let decoded: Option<IncomingMessage<Quote>> =
            decode_stage(&JsonCodec, raw("{not json"), &metrics);
        assert!(decoded.is_none());
        assert_eq!(metrics.unparsable.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fn_decoder() {
        let decoder = FnDecoder::new(|payload: &Bytes| {
            payload
                .first()
                .copied()
                .ok_or_else(|| DecodeError::new("empty payload"))
        });
        assert_eq!(decoder.decode(&Bytes::from_static(&[9, 1])).unwrap(), 9);
        assert!(decoder.decode(&Bytes::new()).is_err());
    }

    #[test]
    fn test_arc_decoder() {
        let decoder: Arc<dyn Decoder<String>> = Arc::new(Utf8Codec);
        assert_eq!(decoder.decode(&Bytes::from_static(b"ok")).unwrap(), "ok");
    }
}
