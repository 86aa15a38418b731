use thiserror::Error;
use uuid::Uuid;

/// Core error type for the sluice domain model.
///
/// Only programming errors and malformed persisted values end up here.
/// I/O failures belong to the storage layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A lifecycle transition was requested from a state that does not allow it.
    #[error("invalid transition for run {run_id}: cannot {event} from {from}")]
    InvalidTransition {
        run_id: Uuid,
        from: &'static str,
        event: &'static str,
    },

    /// An unknown status string was read back from storage.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// A flow carries a cron expression or interval that cannot be evaluated.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// JSON encoding or decoding of a persisted value failed.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
