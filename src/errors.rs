//! Error types for control plane operations

use thiserror::Error;

use crate::state_machine::TransitionError;

/// Errors that can occur in control plane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Entity validation failed (format, missing field)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Uniqueness or write conflict at the document store boundary.
    /// Allocation reads are not transactional; callers retry allocation
    /// when they see this on commit.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Entity not found in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job queue refused the enqueue call
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Remote command failed where the caller has no recovery path
    #[error("{message}: {output}")]
    Remote { message: String, output: String },

    /// SSH/SFTP transport fault
    #[error("Transport error: {0}")]
    Transport(String),

    /// MAC or prefix generation scanned its whole range without finding
    /// a free value
    #[error("Allocation exhausted: {0}")]
    AllocationExhausted(String),

    /// Lifecycle transition refused
    #[error("State error: {0}")]
    State(#[from] TransitionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
