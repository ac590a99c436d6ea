//! Connect-on-demand multiplexing of one connection per destination.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────── Multiplexer ───────────────────────┐
//! ┌───────────┐      │  channels: Destination ─▶ Channel                          │
//! │ Transport │─────▶│     refcount ──── connect on 0→1, disconnect on 1→0        │
//! │  Adapter  │ Sink │     subscribers ─┬─▶ buffer (Unbounded)  ─▶ Subscription   │
//! └───────────┘      │                  ├─▶ buffer (LatestOnly) ─▶ Subscription   │
//!                    │                  └─▶ buffer (Fail)       ─▶ Subscription   │
//!                    └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The refcount change and the connect/disconnect decision happen under the
//! destination's map entry, so a last unsubscribe and a new subscribe for
//! the same destination can never interleave into a double connect or a
//! missing one. Each connection gets a fresh [`Channel`]; nothing carries over
//! from a previous connection of the same destination.

mod buffer;
mod subscription;

pub use buffer::OverflowPolicy;
pub use subscription::{DecodedSubscription, Subscription, SubscriptionId};

use crate::config::MessagingConfig;
use crate::destination::Destination;
use crate::error::{StreamError, TransportError};
use crate::message::{IncomingMessage, TransportMessage};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::publisher::Publisher;
use crate::transport::TransportAdapter;
use buffer::{PushOutcome, SubscriberBuffer};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Multiplexer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexerStats {
    /// Destinations with an open connection
    pub active_destinations: usize,
    /// Live subscriptions across all destinations
    pub active_subscriptions: usize,
    /// Connections opened since creation
    pub connects: u64,
    /// Connections closed since creation
    pub disconnects: u64,
}

/// Shares one transport connection per destination among any number of
/// independent subscriptions.
///
/// Cloning is cheap; clones share the same connection table.
///
/// # Example
///
/// ```rust,ignore
/// let multiplexer = Multiplexer::new(transport, Arc::new(PrometheusMetrics::default()), MessagingConfig::default());
///
/// // First subscription opens the connection
/// let mut quotes = multiplexer.subscribe("quotes", OverflowPolicy::LatestOnly);
/// // Second one shares it
/// let mut audit = multiplexer.subscribe("quotes", OverflowPolicy::Unbounded);
///
/// while let Some(Ok(message)) = quotes.recv().await {
///     println!("{:?}", message.payload());
/// }
///
/// // Dropping the last subscription closes the connection
/// drop(quotes);
/// drop(audit);
/// ```
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MultiplexerInner>,
}

pub(crate) struct MultiplexerInner {
    transport: Arc<dyn TransportAdapter>,
    metrics: Arc<dyn MetricsSink>,
    config: MessagingConfig,
    channels: DashMap<Destination, Arc<Channel>>,
    next_subscription_id: AtomicU64,
    next_connection_id: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl Multiplexer {
    /// Create a multiplexer over `transport`.
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        metrics: Arc<dyn MetricsSink>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                transport,
                metrics,
                config,
                channels: DashMap::new(),
                next_subscription_id: AtomicU64::new(1),
                next_connection_id: AtomicU64::new(1),
                connects: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
            }),
        }
    }

    /// Create a multiplexer with default configuration and no metrics.
    pub fn with_transport(transport: Arc<dyn TransportAdapter>) -> Self {
        Self::new(transport, Arc::new(NoopMetrics), MessagingConfig::default())
    }

    /// Subscribe to `destination` with the configured buffer capacity.
    ///
    /// Never blocks. The first subscription for a destination opens its
    /// connection; if that fails, the returned subscription is already
    /// terminated with a connection fault.
    pub fn subscribe(
        &self,
        destination: impl Into<Destination>,
        policy: OverflowPolicy,
    ) -> Subscription {
        self.subscribe_with_capacity(destination, policy, self.inner.config.buffer_capacity)
    }

    /// Subscribe using the configured default overflow policy.
    pub fn subscribe_default(&self, destination: impl Into<Destination>) -> Subscription {
        self.subscribe(destination, self.inner.config.default_overflow_policy)
    }

    /// Subscribe with an explicit buffer capacity for `DropNewest`/`Fail`.
    pub fn subscribe_with_capacity(
        &self,
        destination: impl Into<Destination>,
        policy: OverflowPolicy,
        capacity: usize,
    ) -> Subscription {
        let destination = destination.into();
        let id = SubscriptionId(self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let buffer = Arc::new(SubscriberBuffer::new(destination.clone(), policy, capacity));

        let channel = self.inner.attach(&destination, id, &buffer);
        self.inner.metrics.subscription_created(&destination);

        debug!(
            destination = %destination,
            subscription_id = %id,
            policy = %policy,
            "Subscription created"
        );

        Subscription::new(id, destination, buffer, channel, self.inner.clone())
    }

    /// Release a subscription. Idempotent.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Number of live subscriptions for `destination`.
    pub fn refcount(&self, destination: &Destination) -> usize {
        self.inner
            .channels
            .get(destination)
            .map(|channel| channel.refcount())
            .unwrap_or(0)
    }

    /// Check if `destination` currently has an open connection.
    pub fn is_connected(&self, destination: &Destination) -> bool {
        self.inner.channels.contains_key(destination)
    }

    /// Get statistics.
    pub fn stats(&self) -> MultiplexerStats {
        let mut stats = MultiplexerStats {
            connects: self.inner.connects.load(Ordering::Acquire),
            disconnects: self.inner.disconnects.load(Ordering::Acquire),
            ..Default::default()
        };
        for entry in self.inner.channels.iter() {
            stats.active_destinations += 1;
            stats.active_subscriptions += entry.value().refcount();
        }
        stats
    }

    /// Disconnect every destination and complete every subscription.
    ///
    /// Subscriptions created afterwards open fresh connections.
    pub fn shutdown(&self) {
        let destinations: Vec<Destination> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for destination in destinations {
            if let Entry::Occupied(entry) = self.inner.channels.entry(destination) {
                let channel = entry.get().clone();
                self.inner.transport.disconnect(&channel.destination);
                self.inner.disconnects.fetch_add(1, Ordering::AcqRel);
                entry.remove();
                channel.close(None);
                info!(destination = %channel.destination, "Connection closed on shutdown");
            }
        }
    }

    /// Get the transport adapter.
    pub fn transport(&self) -> Arc<dyn TransportAdapter> {
        self.inner.transport.clone()
    }

    /// Create a publisher sharing this multiplexer's transport.
    pub fn publisher<E>(&self, encoder: E) -> Publisher<E> {
        Publisher::new(self.transport(), encoder)
    }

    /// Get the metrics sink.
    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.inner.metrics.clone()
    }

    /// Get the configuration.
    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }
}

impl MultiplexerInner {
    /// Attach a buffer to the destination's channel, connecting on 0→1.
    fn attach(
        self: &Arc<Self>,
        destination: &Destination,
        id: SubscriptionId,
        buffer: &Arc<SubscriberBuffer>,
    ) -> Option<Arc<Channel>> {
        match self.channels.entry(destination.clone()) {
            Entry::Occupied(entry) => {
                let channel = entry.get().clone();
                let refcount = channel.attach(id, buffer.clone());
                trace!(destination = %destination, refcount, "Joined existing connection");
                Some(channel)
            }
            Entry::Vacant(entry) => {
                let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let channel = Arc::new(Channel::new(
                    destination.clone(),
                    connection_id,
                    self.metrics.clone(),
                ));
                channel.attach(id, buffer.clone());

                let sink = InboundSink {
                    channel: channel.clone(),
                    multiplexer: Arc::downgrade(self),
                };

                match self.transport.connect(destination, sink) {
                    Ok(()) => {
                        self.connects.fetch_add(1, Ordering::AcqRel);
                        entry.insert(channel.clone());
                        info!(
                            destination = %destination,
                            connection_id,
                            "Connection opened"
                        );
                        Some(channel)
                    }
                    Err(error) => {
                        warn!(
                            destination = %destination,
                            error = %error,
                            "Connection failed"
                        );
                        channel.close(Some(StreamError::ConnectionFault {
                            destination: destination.clone(),
                            source: error,
                        }));
                        None
                    }
                }
            }
        }
    }

    /// Detach a subscription, disconnecting on 1→0.
    fn detach(&self, channel: &Arc<Channel>, id: SubscriptionId) {
        let Entry::Occupied(entry) = self.channels.entry(channel.destination.clone()) else {
            return;
        };
        if !Arc::ptr_eq(entry.get(), channel) {
            // The connection this subscription belonged to is already gone.
            return;
        }

        if channel.detach(id) == 0 {
            self.transport.disconnect(&channel.destination);
            self.disconnects.fetch_add(1, Ordering::AcqRel);
            entry.remove();
            channel.close(None);
            info!(
                destination = %channel.destination,
                connection_id = channel.connection_id,
                "Connection closed"
            );
        }
    }

    /// Tear down a channel whose connection was lost.
    fn connection_lost(&self, channel: &Arc<Channel>, error: TransportError) {
        let removed = match self.channels.entry(channel.destination.clone()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), channel) => {
                self.transport.disconnect(&channel.destination);
                self.disconnects.fetch_add(1, Ordering::AcqRel);
                entry.remove();
                true
            }
            _ => false,
        };

        if removed {
            warn!(
                destination = %channel.destination,
                connection_id = channel.connection_id,
                error = %error,
                "Connection lost"
            );
        }

        channel.close(Some(StreamError::ConnectionFault {
            destination: channel.destination.clone(),
            source: error,
        }));
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }
}

/// One live connection and the buffers of its subscribers.
pub(crate) struct Channel {
    destination: Destination,
    connection_id: u64,
    metrics: Arc<dyn MetricsSink>,
    refcount: AtomicUsize,
    subscribers: Mutex<Vec<(SubscriptionId, Arc<SubscriberBuffer>)>>,
    open: AtomicBool,
}

impl Channel {
    fn new(destination: Destination, connection_id: u64, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            destination,
            connection_id,
            metrics,
            refcount: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    fn attach(&self, id: SubscriptionId, buffer: Arc<SubscriberBuffer>) -> usize {
        self.subscribers.lock().push((id, buffer));
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn detach(&self, id: SubscriptionId) -> usize {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        if subscribers.len() == before {
            return self.refcount();
        }
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn broadcast(&self, message: IncomingMessage<Bytes>) {
        if !self.is_open() {
            trace!(
                destination = %self.destination,
                connection_id = self.connection_id,
                "Dropping payload from closed connection"
            );
            return;
        }

        self.metrics.message_received(&self.destination);

        let subscribers = self.subscribers.lock();
        for (id, buffer) in subscribers.iter() {
            match buffer.push(message.clone()) {
                PushOutcome::Accepted | PushOutcome::Closed => {}
                PushOutcome::Replaced | PushOutcome::Dropped => {
                    self.metrics.message_dropped(&self.destination);
                    debug!(
                        destination = %self.destination,
                        subscription_id = %id,
                        policy = %buffer.policy(),
                        "Message dropped by overflow policy"
                    );
                }
                PushOutcome::Overflowed => {
                    self.metrics.message_dropped(&self.destination);
                    warn!(
                        destination = %self.destination,
                        subscription_id = %id,
                        "Subscription buffer overflowed, terminating subscription"
                    );
                }
            }
        }
    }

    /// Close the channel, ending every attached buffer.
    fn close(&self, error: Option<StreamError>) {
        self.open.store(false, Ordering::Release);
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for (_, buffer) in subscribers {
            match &error {
                Some(error) => buffer.fail(error.clone()),
                None => buffer.complete(),
            }
        }
    }
}

/// Handle given to a transport adapter for one connection.
///
/// Cloneable; every clone feeds the same connection. Once the connection is
/// closed by the multiplexer, further deliveries are ignored, so a stale
/// reader can never leak messages into a later connection for the same
/// destination.
#[derive(Clone)]
pub struct InboundSink {
    channel: Arc<Channel>,
    multiplexer: Weak<MultiplexerInner>,
}

impl InboundSink {
    /// Destination of this connection.
    pub fn destination(&self) -> &Destination {
        &self.channel.destination
    }

    /// Check if the multiplexer still wants messages from this connection.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Broadcast a received message to every subscription of the destination.
    pub fn deliver(&self, message: TransportMessage) {
        let message = IncomingMessage::from_transport(self.channel.destination.clone(), message);
        self.channel.broadcast(message);
    }

    /// Report that the connection was lost.
    ///
    /// Every subscription of the destination terminates with a connection
    /// fault and the destination's state is torn down.
    pub fn fail(&self, error: TransportError) {
        match self.multiplexer.upgrade() {
            Some(multiplexer) => multiplexer.connection_lost(&self.channel, error),
            None => self.channel.close(Some(StreamError::ConnectionFault {
                destination: self.channel.destination.clone(),
                source: error,
            })),
        }
    }
}
