//! Error types for a3s-wamp
//!
//! Peer-visible failures travel as WAMP `ERROR`/`ABORT` messages and never
//! surface here. `RouterError` covers the shared store, transports, codecs
//! and broken internal invariants.

use thiserror::Error;

/// Errors that can occur inside the router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Shared-store backend failure (Redis, in-memory, etc.)
    #[error("Store error: {0}")]
    Store(String),

    /// Connecting to the shared store failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization/deserialization failure of a stored record
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire codec failure (json / msgpack)
    #[error("Codec error: {0}")]
    Codec(String),

    /// A WAMP message could not be parsed
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A distributed lock could not be acquired in time
    #[error("Lock '{key}' not acquired within {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The transport cannot ping its peer
    #[error("Ping not supported by transport {0}")]
    PingNotSupported(String),

    /// Outbound delivery failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No session is known for the transport id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Internal invariant violated (programming error, fatal to the operation)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for RouterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            RouterError::Connection(err.to_string())
        } else {
            RouterError::Store(err.to_string())
        }
    }
}

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, RouterError>;
