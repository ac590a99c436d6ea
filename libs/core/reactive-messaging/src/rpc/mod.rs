//! Request/reply over the multiplexer.
//!
//! # Initiator
//!
//! [`RpcClient`] tags every request with a fresh [`CorrelationId`](crate::CorrelationId)
//! and a reply-to destination, registers it in [`PendingRequests`], and hands
//! back a [`ReplyFuture`]. The request then finishes exactly once, by
//! whichever comes first: the reply, an error reply, the timeout, or a
//! cancellation.
//!
//! ```text
//! send_request ──▶ register ──▶ transport.send ──▶ timer
//!                     │                              │
//!   reply pump ──▶ resolve ◀──── first remover wins ─▶ expire
//! ```
//!
//! # Responder
//!
//! [`RpcServer`] decodes requests, wraps each in an [`RpcInvocation`] and
//! dispatches it through a [`HandlerRegistry`]. Completing the invocation
//! sends the reply (or an error reply) to the request's reply-to
//! destination.

mod client;
mod invocation;
mod pending;
mod registry;
mod reply_future;
mod server;

pub use client::RpcClient;
pub use invocation::RpcInvocation;
pub use pending::PendingRequests;
pub use registry::{HandlerRegistry, RequestHandler, RequestType};
pub use reply_future::ReplyFuture;
pub use server::RpcServer;
