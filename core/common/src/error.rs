//! Common error types for the integration sync engine.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not found (or not visible to the calling tenant).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not allowed in the resource's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The task already has a running execution.
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Adapter could not fetch from the external system.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Record transformation failed.
    #[error("Transform error: {message}")]
    Transform { message: String, recoverable: bool },

    /// A collaborator service (dedup, shard, conflict engine) failed.
    #[error("{service} error: {message}")]
    Collaborator {
        service: &'static str,
        message: String,
        recoverable: bool,
    },

    /// Repository operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transform error.
    pub fn transform(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Transform {
            message: message.into(),
            recoverable,
        }
    }

    /// Create a collaborator error.
    pub fn collaborator(
        service: &'static str,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self::Collaborator {
            service,
            message: message.into(),
            recoverable,
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Transform { recoverable, .. } | Error::Collaborator { recoverable, .. } => {
                *recoverable
            }
            Error::Storage(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this is one of the errors returned by the trigger gate.
    pub fn is_eligibility(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::InvalidState(_) | Error::AlreadyRunning(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
