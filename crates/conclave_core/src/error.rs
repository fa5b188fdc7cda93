//! Coordination error types.

use std::time::Duration;

/// Errors that can occur while coordinating with other contexts.
#[derive(Debug, thiserror::Error)]
pub enum ConclaveError {
    /// A call received no response within its deadline.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote context has no responder registered under this name.
    #[error("No responder registered for {0}")]
    NotFound(String),

    /// The remote responder failed; carries its message verbatim.
    #[error("{0}")]
    Remote(String),

    /// Raised by a local responder. Its message is sent back to the caller.
    #[error("{0}")]
    Handler(String),

    /// The responder declines to answer. Nothing is sent back, so the caller
    /// observes a timeout.
    #[error("Call ignored by responder")]
    Ignored,

    /// The transport was destroyed. Terminal.
    #[error("Transport was destroyed")]
    Destroyed,

    /// A responder was registered twice under the same name.
    #[error("Responder for {0} already registered")]
    DuplicateResponder(String),

    /// The underlying medium or hub link failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Build a responder failure whose message reaches the caller unchanged.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Whether this error is a call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result alias used across the conclave crates.
pub type Result<T> = std::result::Result<T, ConclaveError>;
