//! Domain types for the sluice run orchestrator.
//!
//! Nothing in this module performs I/O. Everything time-dependent takes `now`
//! as an argument so the same rules can be evaluated by any process.
//!
//! # Domain Model
//! - [`Flow`]: a configured recurring pipeline and its [`RuntimeConfig`]
//! - [`Run`]: one scheduled execution of a flow
//! - [`RunStatus`]: the run lifecycle (`pending -> in_progress -> success | failed`,
//!   plus cancellation)
//!
//! # Progress
//! - [`ProgressUpdate`]: partial, merge-style progress report
//! - [`Progress`]: read view over a run's progress metadata
//!
//! # Scheduling and diagnostics
//! - [`schedule`]: cron and interval arithmetic
//! - [`diagnostics`]: backtrace capture and bounding
//!
//! # Example
//!
//! ```
//! use sluice::core::{ProgressUpdate, Run, RunStatus};
//! use chrono::Utc;
//!
//! let mut run = Run::new("orders", Utc::now());
//! run.start(Utc::now()).unwrap();
//! run.update_progress(ProgressUpdate::new().step("fetch").cursor(120).records(120), Utc::now());
//! run.complete(Utc::now()).unwrap();
//!
//! assert_eq!(run.status(), RunStatus::Success);
//! assert_eq!(run.records_processed(), Some(120));
//! ```

pub mod diagnostics;
mod error;
mod flow;
mod progress;
mod run;
pub mod schedule;

pub use diagnostics::{bounded_backtrace, capture_backtrace, DEFAULT_BACKTRACE_FRAMES};
pub use error::{CoreError, Result};
pub use flow::{Flow, FlowStatus, RuntimeConfig};
pub use progress::{Progress, ProgressUpdate};
pub use run::{Run, RunStatus, OVERDUE_THRESHOLD};
pub use schedule::{next_cron_run, next_interval_run, validate_cron};
