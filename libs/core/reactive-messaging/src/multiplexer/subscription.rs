//! Subscription handles returned by the multiplexer.

use super::buffer::SubscriberBuffer;
use super::{Channel, MultiplexerInner, OverflowPolicy};
use crate::codec::{decode_stage, Decoder};
use crate::destination::Destination;
use crate::error::StreamError;
use crate::message::IncomingMessage;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Unique id of a subscription within its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    /// Get the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One consumer's view of a destination's shared connection.
///
/// Yields raw messages in arrival order, subject to the subscription's
/// [`OverflowPolicy`]. The stream ends with `None` after an unsubscribe or a
/// multiplexer shutdown, or with a single `Err` on a connection fault or an
/// overflow under [`OverflowPolicy::Fail`].
///
/// Dropping a subscription releases it.
pub struct Subscription {
    id: SubscriptionId,
    destination: Destination,
    buffer: Arc<SubscriberBuffer>,
    channel: Option<Arc<Channel>>,
    multiplexer: Arc<MultiplexerInner>,
    released: AtomicBool,
}

impl Subscription {
    pub(super) fn new(
        id: SubscriptionId,
        destination: Destination,
        buffer: Arc<SubscriberBuffer>,
        channel: Option<Arc<Channel>>,
        multiplexer: Arc<MultiplexerInner>,
    ) -> Self {
        Self {
            id,
            destination,
            buffer,
            channel,
            multiplexer,
            released: AtomicBool::new(false),
        }
    }

    /// Get the subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Get the destination.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Get the overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.buffer.policy()
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<IncomingMessage<Bytes>, StreamError>> {
        self.buffer.recv().await
    }

    /// Take the next message if one is pending.
    ///
    /// Also returns `None` once the stream has ended; use
    /// [`is_terminated`](Self::is_terminated) to tell the two apart.
    pub fn try_recv(&mut self) -> Option<Result<IncomingMessage<Bytes>, StreamError>> {
        self.buffer.poll_next().flatten()
    }

    /// Number of messages waiting in this subscription's buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of messages this subscription's overflow policy has discarded.
    pub fn dropped_count(&self) -> u64 {
        self.buffer.dropped()
    }

    /// Check if the stream has ended (normally or with an error).
    pub fn is_terminated(&self) -> bool {
        self.buffer.is_terminated()
    }

    /// Release this subscription.
    ///
    /// Idempotent. The stream ends immediately; messages still buffered are
    /// discarded. Releasing the last subscription of a destination closes
    /// its connection.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.buffer.complete();
        if let Some(channel) = &self.channel {
            self.multiplexer.detach(channel, self.id);
        }
        self.multiplexer.metrics().subscription_destroyed(&self.destination);

        debug!(
            destination = %self.destination,
            subscription_id = %self.id,
            "Subscription released"
        );
    }

    /// Convert into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<IncomingMessage<Bytes>, StreamError>> {
        stream::unfold(self, |mut subscription| async move {
            let item = subscription.recv().await?;
            Some((item, subscription))
        })
    }

    /// Apply a decode stage to this subscription.
    ///
    /// Payloads that fail to decode are counted and skipped; the stream
    /// continues with the next message.
    pub fn decoded<T, D>(self, decoder: D) -> DecodedSubscription<T, D>
    where
        D: Decoder<T>,
    {
        DecodedSubscription {
            inner: self,
            decoder,
            _marker: PhantomData,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("policy", &self.buffer.policy())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

/// A subscription whose payloads pass through a [`Decoder`].
pub struct DecodedSubscription<T, D> {
    inner: Subscription,
    decoder: D,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D> DecodedSubscription<T, D>
where
    D: Decoder<T>,
{
    /// Wait for the next message that decodes successfully.
    pub async fn recv(&mut self) -> Option<Result<IncomingMessage<T>, StreamError>> {
        loop {
            match self.inner.recv().await? {
                Ok(message) => {
                    let metrics = self.inner.multiplexer.metrics();
                    if let Some(decoded) = decode_stage(&self.decoder, message, metrics.as_ref()) {
                        return Some(Ok(decoded));
                    }
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }

    /// Convert into a `futures::Stream` of decoded messages.
    pub fn into_stream(self) -> impl Stream<Item = Result<IncomingMessage<T>, StreamError>> {
        stream::unfold(self, |mut subscription| async move {
            let item = subscription.recv().await?;
            Some((item, subscription))
        })
    }

    /// Get the underlying subscription.
    pub fn subscription(&self) -> &Subscription {
        &self.inner
    }

    /// Release the underlying subscription.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }
}
