//! Persistence error model shared by every store implementation.

use thiserror::Error;

use shopdesk_core::DomainError;

/// Error returned by invoice, job queue and gateway-config stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A business rule rejected the operation (not retried).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A row expected by the operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification: a unique constraint fired or a job lease was
    /// lost to another worker.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored JSON payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other database failure (connection, constraint, decode).
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
