//! Metrics sink that records every event for assertions.

use parking_lot::Mutex;
use reactive_messaging::{Destination, MetricsSink};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle events reported through [`MetricsSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    MessageReceived,
    UnparsableMessageReceived,
    MessageDropped,
    SubscriptionCreated,
    SubscriptionDestroyed,
    RpcCompleted,
    RpcTimedOut,
    RequestReceived,
    RequestCompleted,
    RequestCompletedExceptionally,
    UnregisteredRequest,
}

/// Counts events per destination.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counts: Mutex<HashMap<(MetricEvent, Destination), u64>>,
}

impl RecordingMetrics {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: MetricEvent, destination: &Destination) {
        *self
            .counts
            .lock()
            .entry((event, destination.clone()))
            .or_default() += 1;
    }

    /// Count of `event` for `destination`.
    pub fn count(&self, event: MetricEvent, destination: impl Into<Destination>) -> u64 {
        self.counts
            .lock()
            .get(&(event, destination.into()))
            .copied()
            .unwrap_or(0)
    }

    /// Count of `event` across all destinations.
    pub fn total(&self, event: MetricEvent) -> u64 {
        self.counts
            .lock()
            .iter()
            .filter(|((e, _), _)| *e == event)
            .map(|(_, n)| n)
            .sum()
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn message_received(&self, destination: &Destination) {
        self.record(MetricEvent::MessageReceived, destination);
    }

    fn unparsable_message_received(&self, destination: &Destination) {
        self.record(MetricEvent::UnparsableMessageReceived, destination);
    }

    fn message_dropped(&self, destination: &Destination) {
        self.record(MetricEvent::MessageDropped, destination);
    }

    fn subscription_created(&self, destination: &Destination) {
        self.record(MetricEvent::SubscriptionCreated, destination);
    }

    fn subscription_destroyed(&self, destination: &Destination) {
        self.record(MetricEvent::SubscriptionDestroyed, destination);
    }

    fn rpc_completed(&self, destination: &Destination, _elapsed: Duration) {
        self.record(MetricEvent::RpcCompleted, destination);
    }

    fn rpc_timed_out(&self, destination: &Destination, _elapsed: Duration) {
        self.record(MetricEvent::RpcTimedOut, destination);
    }

    fn request_received(&self, destination: &Destination) {
        self.record(MetricEvent::RequestReceived, destination);
    }

    fn request_completed(&self, destination: &Destination) {
        self.record(MetricEvent::RequestCompleted, destination);
    }

    fn request_completed_exceptionally(&self, destination: &Destination) {
        self.record(MetricEvent::RequestCompletedExceptionally, destination);
    }

    fn unregistered_request(&self, destination: &Destination) {
        self.record(MetricEvent::UnregisteredRequest, destination);
    }
}
