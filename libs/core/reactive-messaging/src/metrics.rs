//! Lifecycle metrics for subscriptions and request/reply traffic.
//!
//! The core reports to a [`MetricsSink`]. Every method is fire-and-forget and
//! defaults to a no-op, so a sink can never block or fail the caller.

use crate::destination::Destination;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Receiver of named lifecycle events.
///
/// Implementations must return quickly; they are called on the hot path of
/// message delivery and request resolution.
pub trait MetricsSink: Send + Sync + 'static {
    /// A raw payload was received from a connection (once per payload).
    fn message_received(&self, _destination: &Destination) {}

    /// A payload could not be decoded and was dropped.
    fn unparsable_message_received(&self, _destination: &Destination) {}

    /// A payload was discarded by a subscription's overflow policy.
    fn message_dropped(&self, _destination: &Destination) {}

    /// A subscription was created.
    fn subscription_created(&self, _destination: &Destination) {}

    /// A subscription was released.
    fn subscription_destroyed(&self, _destination: &Destination) {}

    /// A request was resolved by its reply.
    fn rpc_completed(&self, _destination: &Destination, _elapsed: Duration) {}

    /// A request was resolved by its deadline.
    fn rpc_timed_out(&self, _destination: &Destination, _elapsed: Duration) {}

    /// A request was received by the responder.
    fn request_received(&self, _destination: &Destination) {}

    /// A received request was completed with a reply.
    fn request_completed(&self, _destination: &Destination) {}

    /// A received request was completed with an error.
    fn request_completed_exceptionally(&self, _destination: &Destination) {}

    /// A received request had no handler for its type.
    fn unregistered_request(&self, _destination: &Destination) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Metrics sink backed by the `metrics` facade.
///
/// Every series carries a `destination` label. Install a recorder with
/// [`init_metrics`] to export them in Prometheus format.
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    prefix: String,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new("messaging")
    }
}

impl PrometheusMetrics {
    /// Create a sink whose metric names start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn name(&self, metric: &str) -> String {
        format!("{}_{}", self.prefix, metric)
    }

    fn increment(&self, metric: &str, destination: &Destination) {
        counter!(self.name(metric), "destination" => destination.to_string()).increment(1);
    }
}

impl MetricsSink for PrometheusMetrics {
    fn message_received(&self, destination: &Destination) {
        self.increment("messages_received_total", destination);
    }

    fn unparsable_message_received(&self, destination: &Destination) {
        self.increment("messages_unparsable_total", destination);
    }

    fn message_dropped(&self, destination: &Destination) {
        self.increment("messages_dropped_total", destination);
    }

    fn subscription_created(&self, destination: &Destination) {
        self.increment("subscriptions_created_total", destination);
        gauge!(self.name("subscriptions_active"), "destination" => destination.to_string())
            .increment(1.0);
    }

    fn subscription_destroyed(&self, destination: &Destination) {
        self.increment("subscriptions_destroyed_total", destination);
        gauge!(self.name("subscriptions_active"), "destination" => destination.to_string())
            .decrement(1.0);
    }

    fn rpc_completed(&self, destination: &Destination, elapsed: Duration) {
        self.increment("rpc_completed_total", destination);
        histogram!(self.name("rpc_duration_seconds"), "destination" => destination.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn rpc_timed_out(&self, destination: &Destination, _elapsed: Duration) {
        self.increment("rpc_timed_out_total", destination);
    }

    fn request_received(&self, destination: &Destination) {
        self.increment("requests_received_total", destination);
    }

    fn request_completed(&self, destination: &Destination) {
        self.increment("requests_completed_total", destination);
    }

    fn request_completed_exceptionally(&self, destination: &Destination) {
        self.increment("requests_failed_total", destination);
    }

    fn unregistered_request(&self, destination: &Destination) {
        self.increment("requests_unregistered_total", destination);
    }
}

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}
