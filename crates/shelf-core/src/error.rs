//! Collaborator error types

use thiserror::Error;

/// Errors returned by external collaborators (annotator, store, indexer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// A failure that may succeed on retry (rate limit, dropped connection)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A failure that will not succeed on retry (malformed input, rejected content)
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The collaborator is not reachable or not initialised
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// Any other failure
    #[error("Collaborator error: {0}")]
    Other(String),
}

/// Specialized Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

impl CollaboratorError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Check if this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unavailable(_))
    }
}
