//! Error types for the connection library.
//!
//! Only precondition failures surface here. Transport faults that happen
//! inside I/O completions are classified by [`crate::fault`] and handled at
//! that boundary; they never come back through these types.

use tcplink_core::CoreError;

use crate::connection::ConnectionId;

/// Errors returned by the public client and server operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    /// The configured address could not be parsed or resolved.
    #[error("Invalid address '{address}': {message}")]
    InvalidAddress {
        /// The address as configured.
        address: String,
        /// Why it was rejected.
        message: String,
    },
    /// The listener socket could not be configured, bound or put in listening mode.
    #[error("Failed to bind {address}: {message}")]
    Bind {
        /// The address the listener tried to bind.
        address: String,
        /// The underlying socket error.
        message: String,
    },
    /// The session is shutting down; queued work was discarded.
    #[error("Session is shutting down")]
    ShuttingDown,
    /// The server is not running.
    #[error("Server is not running")]
    NotRunning,
    /// No connection is registered under this identifier.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    /// A typed payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A fault was escalated to the supervisor and the session stopped.
    #[error("Session stopped after an unrecoverable fault: {0}")]
    Escalated(String),
    /// I/O error outside any connection's completion chain.
    #[error("I/O error: {0}")]
    Io(String),
    /// Runtime plumbing error.
    #[error(transparent)]
    Runtime(#[from] CoreError),
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A specialized Result type for connection operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
