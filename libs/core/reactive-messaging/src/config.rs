//! Configuration for the multiplexer and the RPC engine.

use crate::error::ConfigError;
use crate::multiplexer::OverflowPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default bound for `DropNewest` and `Fail` subscription buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 128;

/// Default request timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Messaging configuration.
///
/// Shared by the [`Multiplexer`](crate::Multiplexer), the
/// [`RpcClient`](crate::RpcClient) and the [`RpcServer`](crate::RpcServer).
///
/// # Environment
///
/// | Variable | Default |
/// |----------|---------|
/// | `MESSAGING_BUFFER_CAPACITY` | `128` |
/// | `MESSAGING_OVERFLOW_POLICY` | `unbounded` |
/// | `MESSAGING_RPC_TIMEOUT_MS` | `30000` |
/// | `MESSAGING_REPLY_OVERFLOW_POLICY` | `unbounded` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    /// Bound for `DropNewest` and `Fail` subscription buffers
    pub buffer_capacity: usize,

    /// Policy used by `Multiplexer::subscribe_default`
    pub default_overflow_policy: OverflowPolicy,

    /// Timeout used by `RpcClient::request`
    pub rpc_timeout: Duration,

    /// Policy of the subscriptions owned by the RPC client and server
    pub reply_overflow_policy: OverflowPolicy,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            default_overflow_policy: OverflowPolicy::Unbounded,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            reply_overflow_policy: OverflowPolicy::Unbounded,
        }
    }
}

impl MessagingConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Set the default overflow policy.
    pub fn with_default_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.default_overflow_policy = policy;
        self
    }

    /// Set the default request timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the overflow policy of RPC-owned subscriptions.
    pub fn with_reply_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.reply_overflow_policy = policy;
        self
    }
}

impl FromEnv for MessagingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let buffer_capacity = env_parse("MESSAGING_BUFFER_CAPACITY", defaults.buffer_capacity)?;
        if buffer_capacity == 0 {
            return Err(ConfigError::ParseError {
                key: "MESSAGING_BUFFER_CAPACITY".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            buffer_capacity,
            default_overflow_policy: env_parse(
                "MESSAGING_OVERFLOW_POLICY",
                defaults.default_overflow_policy,
            )?,
            rpc_timeout: Duration::from_millis(env_parse(
                "MESSAGING_RPC_TIMEOUT_MS",
                defaults.rpc_timeout.as_millis() as u64,
            )?),
            reply_overflow_policy: env_parse(
                "MESSAGING_REPLY_OVERFLOW_POLICY",
                defaults.reply_overflow_policy,
            )?,
        })
    }
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
