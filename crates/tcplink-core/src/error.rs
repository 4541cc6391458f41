//! Error types for tcplink core.

/// Errors raised by the core runtime plumbing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// The global runtime has already been initialized.
    #[error("async runtime already initialized")]
    RuntimeAlreadyInitialized,
    /// Failed to create the tokio runtime.
    #[error("failed to create async runtime: {0}")]
    RuntimeCreation(String),
}

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
