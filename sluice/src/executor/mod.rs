//! Execution layer: running units, per-flow exclusion, and scheduling.
//!
//! - [`Registry`] maps a flow's `processor` identifier to a [`ProcessingUnit`] factory
//! - [`Executor`] drives one run from `pending` to a terminal state
//! - [`ConcurrencyController`] keeps runs sharing a concurrency key apart and
//!   plans bulk or staggered dispatch
//! - [`Scheduler`] sweeps due runs, plans the next ones and runs the
//!   background loop ([`SchedulerHandle`])
//!
//! # Example
//!
//! ```no_run
//! use sluice::config::SchedulerConfig;
//! use sluice::core::Flow;
//! use sluice::executor::{Executor, Failure, ProcessingUnit, Registry, RunContext, Scheduler};
//! use sluice::storage::{InMemoryRunRepository, RunRepository};
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct CopyOrders;
//!
//! #[async_trait]
//! impl ProcessingUnit for CopyOrders {
//!     async fn process(&self, _ctx: RunContext, _cursor: Option<Value>) -> Result<(), Failure> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Arc::new(InMemoryRunRepository::new());
//! repo.save_flow(&Flow::new("orders", "copy_orders")).await?;
//!
//! let mut registry = Registry::new();
//! registry.register_unit("copy_orders", Arc::new(CopyOrders));
//!
//! let scheduler = Scheduler::new(Executor::new(repo, registry), SchedulerConfig::default());
//! let handle = scheduler.start();
//! // ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod concurrency;
mod error;
mod run_executor;
mod scheduler;
mod unit;

pub use concurrency::{ConcurrencyController, DispatchMode, DispatchPermit, DispatchTicket};
pub use error::{ExecutionError, Result};
pub use run_executor::Executor;
pub use scheduler::{Scheduler, SchedulerHandle, SweepSummary};
pub use unit::{BoxError, Failure, ProcessingUnit, Registry, RunContext, UnitFactory};
