use crate::core::CoreError;
use crate::storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Execution layer error type for the sluice run orchestrator.
///
/// A failing processing unit is recorded on its run and *also* surfaced here
/// as [`ExecutionError::ExecutionFailure`], so callers can count it without
/// reloading the run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The run is not in a state that allows the requested lifecycle step.
    #[error("invalid transition: {0}")]
    InvalidTransition(#[source] CoreError),

    /// Another run holds the flow's concurrency key.
    #[error("flow '{flow}' is already running under key '{key}'")]
    ConcurrentExecution { flow: String, key: String },

    /// The processing unit reported a failure, or panicked.
    #[error("run {run_id} failed ({kind}): {message}")]
    ExecutionFailure {
        run_id: Uuid,
        kind: String,
        message: String,
    },

    /// A collaborator (the repository, the registry) was unavailable.
    #[error("dependency unavailable: {0}")]
    Dependency(String),
}

impl ExecutionError {
    /// Whether the run was left untouched and may be retried by a later sweep.
    pub fn is_deferral(&self) -> bool {
        matches!(self, ExecutionError::ConcurrentExecution { .. })
    }
}

impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        ExecutionError::Dependency(e.to_string())
    }
}

impl From<CoreError> for ExecutionError {
    fn from(e: CoreError) -> Self {
        ExecutionError::InvalidTransition(e)
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
