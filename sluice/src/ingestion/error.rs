use std::time::Duration;
use thiserror::Error;

/// Ingestion layer error type for the sluice run orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestionError {
    /// The channel is at capacity; the record was not accepted.
    #[error("ingestion queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The channel no longer accepts records.
    #[error("ingestion channel is stopped")]
    Stopped,

    /// The accept loop did not report readiness in time.
    #[error("listener did not become ready within {0:?}")]
    StartTimeout(Duration),

    #[error("listener is already running")]
    AlreadyRunning,

    #[error("failed to bind listener")]
    Bind(#[source] std::io::Error),

    /// A line received by the listener was not valid JSON.
    #[error("malformed record: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IngestionError>;
