//! Sluice: recurring data-pipeline run orchestrator
//!
//! `sluice` keeps a set of named data flows (source → processing unit → sink)
//! running on a schedule. Each execution is a persisted [`Run`] with a
//! lifecycle, progress checkpoints, and failure diagnostics, so an
//! interrupted run resumes from its last cursor instead of starting over.
//!
//! # Features
//!
//! - **Due-run sweeps**: claims due runs atomically, so two workers never execute the same run
//! - **Resumable execution**: progress checkpoints are persisted as they are reported
//! - **Per-flow exclusion**: at most one active run per flow (or per concurrency group)
//! - **Failure isolation**: a failing or panicking unit fails its run, never the sweep
//! - **Staggered dispatch**: spread many flows over time to spare shared sources
//! - **Pluggable storage**: in-memory, SQLite and Postgres backends behind one trait
//!
//! # Quick Start
//!
//! ```no_run
//! use sluice::prelude::*;
//!
//! struct CopyOrders;
//!
//! #[async_trait]
//! impl ProcessingUnit for CopyOrders {
//!     async fn process(&self, ctx: RunContext, cursor: Option<Value>) -> Result<(), Failure> {
//!         let from = cursor.and_then(|c| c.as_u64()).unwrap_or(0);
//!         ctx.update_progress(ProgressUpdate::new().cursor(from + 100).records(100))
//!             .await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = Arc::new(InMemoryRunRepository::new());
//!     let flow = Flow::new("orders", "copy_orders")
//!         .with_runtime_config(RuntimeConfig::every(std::time::Duration::from_secs(300)));
//!     repo.save_flow(&flow).await?;
//!
//!     let mut registry = Registry::new();
//!     registry.register_unit("copy_orders", Arc::new(CopyOrders));
//!
//!     let scheduler = Scheduler::new(Executor::new(repo, registry), SchedulerConfig::default());
//!     let summary = scheduler.trigger().await?;
//!     println!("{} succeeded, {} failed", summary.success_count, summary.error_count);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: flows, runs, the run state machine, progress and schedules
//! - [`storage`]: the [`RunRepository`] trait and its backends
//! - [`executor`]: processing units, the executor, concurrency control and the scheduler
//! - [`ingestion`]: a bounded record channel and a TCP source for it
//! - [`config`]: runtime configuration

pub mod config;
pub mod core;
pub mod executor;
pub mod ingestion;
pub mod storage;

pub use config::{ConcurrencyConfig, ExecutorConfig, ListenerConfig, SchedulerConfig};

pub use core::{
    CoreError, Flow, FlowStatus, Progress, ProgressUpdate, Result as CoreResult, Run, RunStatus,
    RuntimeConfig,
};

pub use executor::{
    ConcurrencyController, DispatchMode, DispatchTicket, ExecutionError, Executor, Failure,
    ProcessingUnit, Registry, Result as ExecutionResult, RunContext, Scheduler, SchedulerHandle,
    SweepSummary,
};

pub use ingestion::{Health, IngestionChannel, IngestionError, IngestionListener};

pub use storage::{
    BackendConfig, InMemoryRunRepository, PoolConfig, Result as StorageResult, RunRepository,
    StorageError,
};

#[cfg(feature = "sqlite")]
pub use storage::SqliteRunRepository;

#[cfg(feature = "postgres")]
pub use storage::PostgresRunRepository;

// Dependencies that appear in the public API.
pub use async_trait::async_trait;
pub use chrono;
pub use serde_json;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use sluice::prelude::*;
///
/// let flow = Flow::new("orders", "copy_orders");
/// assert_eq!(flow.concurrency_key(), "flow:orders");
/// ```
pub mod prelude {
    pub use crate::config::{ConcurrencyConfig, ExecutorConfig, ListenerConfig, SchedulerConfig};

    pub use crate::core::{
        Flow, FlowStatus, Progress, ProgressUpdate, Run, RunStatus, RuntimeConfig,
    };

    pub use crate::executor::{
        DispatchMode, ExecutionError, Executor, Failure, ProcessingUnit, Registry, RunContext,
        Scheduler, SchedulerHandle, SweepSummary,
    };

    pub use crate::ingestion::{IngestionChannel, IngestionListener};

    pub use crate::storage::{InMemoryRunRepository, RunRepository, StorageError};

    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteRunRepository;

    pub use async_trait::async_trait;
    pub use serde_json::Value;
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
