//! Transport-agnostic reactive messaging core.
//!
//! This library sits between your code and a transport adapter (TCP, AMQP,
//! HTTP, ...) and provides:
//! - **Multiplexing**: one connection per destination, shared by any number of
//!   subscriptions, opened on the first subscribe and closed on the last release
//! - **Overflow policies**: per-subscription handling of slow consumers
//! - **Decoding**: typed payloads, with malformed messages counted and skipped
//! - **Request/Reply**: correlation ids, timeouts and typed handler dispatch
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐      ┌──────────────────────────────────────────────┐
//! │ Transport Adapter  │      │                Multiplexer                   │
//! │                    │ Sink │  destination ─▶ refcount + subscriber buffers │
//! │  connect/disconnect│─────▶│                      │                       │
//! │  send              │      └──────────────────────┼───────────────────────┘
//! └────────────────────┘                             ▼
//!          ▲                     Subscription ──▶ decode stage ──▶ your code
//!          │                                         │
//!          │        ┌────────────┐                   │        ┌────────────┐
//!          └────────│ RpcClient  │◀─ replies ────────┴──────▶ │ RpcServer  │
//!            send   │ (pending)  │                   requests │ (handlers) │
//!                   └────────────┘                            └────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use reactive_messaging::{
//!     JsonCodec, MessagingConfig, Multiplexer, OverflowPolicy, PrometheusMetrics, RpcClient,
//! };
//!
//! let multiplexer = Multiplexer::new(
//!     Arc::new(MyAdapter::connect(url).await?),
//!     Arc::new(PrometheusMetrics::default()),
//!     MessagingConfig::from_env()?,
//! );
//!
//! // Subscribe to a stream of quotes, keeping only the latest one
//! let mut quotes = multiplexer
//!     .subscribe("quotes", OverflowPolicy::LatestOnly)
//!     .decoded::<Quote, _>(JsonCodec);
//!
//! while let Some(Ok(quote)) = quotes.recv().await {
//!     render(quote.payload());
//! }
//!
//! // Request/reply
//! let client: RpcClient<Balance> = RpcClient::start(&multiplexer, "client-1.replies", JsonCodec);
//! let balance = client.request(serde_json::to_vec(&query)?, "accounts").await?;
//! ```

mod codec;
mod config;
mod destination;
mod error;
mod message;
mod metrics;
mod multiplexer;
mod publisher;
mod rpc;
mod transport;

pub use codec::{decode_stage, BytesCodec, Decoder, Encoder, FnDecoder, JsonCodec, Utf8Codec};
pub use config::{
    env_or_default, env_required, FromEnv, MessagingConfig, DEFAULT_BUFFER_CAPACITY,
    DEFAULT_RPC_TIMEOUT,
};
pub use destination::{CorrelationId, Destination};
pub use error::{
    ConfigError, DecodeError, EncodeError, HandlerError, InvocationError, PublishError,
    RegistrationError, RpcError, StreamError, TransportError,
};
pub use message::{IncomingMessage, MessageMetadata, TransportMessage, ERROR_HEADER};
pub use metrics::{init_metrics, render_metrics, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use multiplexer::{
    DecodedSubscription, InboundSink, Multiplexer, MultiplexerStats, OverflowPolicy,
    Subscription, SubscriptionId,
};
pub use publisher::Publisher;
pub use rpc::{
    HandlerRegistry, PendingRequests, ReplyFuture, RequestHandler, RequestType, RpcClient,
    RpcInvocation, RpcServer,
};
pub use transport::TransportAdapter;
