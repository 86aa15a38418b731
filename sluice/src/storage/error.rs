use crate::core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type for the sluice run orchestrator.
///
/// Wraps backend and serialization errors while preserving the full error
/// chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// A persisted value could not be turned back into a domain type.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The requested run was not found in storage.
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The requested flow was not found in storage.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// Connecting to the backend failed, or a stored identifier was malformed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A stored column holds a value that cannot be decoded.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// JSON columns could not be encoded or decoded.
    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
