//! Shared test utilities for messaging tests
//!
//! This crate provides reusable test infrastructure:
//! - `InMemoryTransport`: loopback transport adapter with fault injection
//! - `RecordingMetrics`: metrics sink counting every event per destination
//! - `TestDataBuilder`: deterministic destination names per test
//! - `init_test_tracing`: tracing output for tests, driven by `RUST_LOG`
//! - `assertions`: custom assertion helpers
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reactive_messaging::{MessagingConfig, Multiplexer, OverflowPolicy};
//! use test_utils::{InMemoryTransport, MetricEvent, RecordingMetrics, TestDataBuilder};
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let transport = Arc::new(InMemoryTransport::new());
//!     let metrics = Arc::new(RecordingMetrics::new());
//!     let multiplexer = Multiplexer::new(transport.clone(), metrics.clone(), MessagingConfig::default());
//!
//!     let builder = TestDataBuilder::from_test_name("my_test");
//!     let quotes = builder.destination("quotes");
//!     let _sub = multiplexer.subscribe(quotes.clone(), OverflowPolicy::Unbounded);
//!
//!     assert_eq!(transport.connect_count(quotes.clone()), 1);
//!     assert_eq!(metrics.count(MetricEvent::SubscriptionCreated, quotes), 1);
//! }
//! ```

mod metrics;
mod transport;

pub use metrics::{MetricEvent, RecordingMetrics};
pub use transport::InMemoryTransport;

use reactive_messaging::Destination;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Initialize tracing for tests
///
/// Uses `RUST_LOG` when set, `warn` otherwise. Safe to call from every test;
/// only the first call installs a subscriber.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}

/// Builder for test data with deterministic randomization
///
/// Gives each test its own destination names so tests sharing a transport
/// never see each other's traffic.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_ping_pong");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a destination name unique to this builder
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.destination("quotes").as_str(), "test-quotes-7");
    /// ```
    pub fn destination(&self, name: &str) -> Destination {
        Destination::new(format!("test-{}-{}", name, self.seed))
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Wait until `condition` holds, polling every few milliseconds
    ///
    /// Panics with `context` if it does not hold within `timeout`.
    pub async fn assert_eventually<F>(timeout: Duration, context: &str, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Await `future`, panicking with `context` if it takes longer than `timeout`
    pub async fn within<T>(timeout: Duration, context: &str, future: impl Future<Output = T>) -> T {
        tokio::time::timeout(timeout, future)
            .await
            .unwrap_or_else(|_| panic!("{}: timed out after {:?}", context, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.destination("orders"), builder2.destination("orders"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        // Different test names should generate different destinations
        assert_ne!(builder1.destination("orders"), builder2.destination("orders"));
    }

    #[test]
    fn test_init_test_tracing_is_repeatable() {
        init_test_tracing();
        init_test_tracing();
    }
}
