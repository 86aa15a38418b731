use super::concurrency::ConcurrencyController;
use super::error::{ExecutionError, Result};
use super::unit::{Failure, Registry, RunContext};
use crate::config::ExecutorConfig;
use crate::core::{CoreError, Flow, ProgressUpdate, Run, RunStatus};
use crate::storage::{RunRepository, StorageError};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const ERROR_KIND_KEY: &str = "error_kind";
const ERROR_DETAILS_KEY: &str = "error_details";

/// Owns the lifecycle of a single run.
///
/// `execute` is the only way a run moves through `start`, `complete` and
/// `fail` outside of tests. Every state change is saved before the next step
/// begins, and progress a unit reports is saved as it arrives.
pub struct Executor<R: RunRepository + 'static> {
    repo: Arc<R>,
    registry: Arc<Registry>,
    controller: ConcurrencyController,
    config: ExecutorConfig,
}

impl<R: RunRepository + 'static> Clone for Executor<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            registry: self.registry.clone(),
            controller: self.controller.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: RunRepository + 'static> Executor<R> {
    pub fn new(repo: Arc<R>, registry: Registry) -> Self {
        Self {
            repo,
            registry: Arc::new(registry),
            controller: ConcurrencyController::default(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_controller(mut self, controller: ConcurrencyController) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs `run` to a terminal state.
    ///
    /// Accepts a pending run or a resumable in-progress one. Returns the
    /// finished run on success. A unit failure is recorded on the run and
    /// returned as [`ExecutionError::ExecutionFailure`]. When the flow's
    /// concurrency key is taken the run is left untouched and
    /// [`ExecutionError::ConcurrentExecution`] is returned.
    pub async fn execute(&self, run: Run) -> Result<Run> {
        let resumed = run.status() == RunStatus::InProgress;
        let span = info_span!(
            "run_execution",
            run.id = %run.id(),
            flow.name = %run.flow_name(),
            resumed,
        );
        self.execute_inner(run, resumed).instrument(span).await
    }

    async fn execute_inner(&self, run: Run, resumed: bool) -> Result<Run> {
        match run.status() {
            RunStatus::Pending => {}
            RunStatus::InProgress if run.is_resumable() => {}
            RunStatus::InProgress => {
                return Err(ExecutionError::ConcurrentExecution {
                    flow: run.flow_name().to_string(),
                    key: format!("run:{}", run.id()),
                });
            }
            status => {
                return Err(ExecutionError::InvalidTransition(
                    CoreError::InvalidTransition {
                        run_id: run.id(),
                        from: status.as_str(),
                        event: "execute",
                    },
                ));
            }
        }

        let flow = self.repo.get_flow(run.flow_name()).await?;
        let key = flow
            .as_ref()
            .map(Flow::concurrency_key)
            .unwrap_or_else(|| format!("flow:{}", run.flow_name()));

        let _permit = self.controller.try_acquire(&key).ok_or_else(|| {
            ExecutionError::ConcurrentExecution {
                flow: run.flow_name().to_string(),
                key: key.clone(),
            }
        })?;

        if !resumed {
            self.ensure_no_active_run(&run, &key).await?;
        }

        // The stored row decides who starts the run; a stale or foreign copy loses here.
        let Some(mut run) = self
            .repo
            .try_start(run.id(), run.status(), run.claimed_by(), Utc::now())
            .await?
        else {
            debug!("Stored run no longer matches this copy, not starting");
            return Err(ExecutionError::ConcurrentExecution {
                flow: run.flow_name().to_string(),
                key,
            });
        };

        if resumed {
            let resumptions = run.progress().resumptions().unwrap_or(0) + 1;
            run.update_progress(ProgressUpdate::new().resumptions(resumptions), Utc::now());
            self.repo.save(&run).await?;
            info!(resumptions, "Resuming run from saved cursor");
        } else {
            info!("Run started");
        }

        let Some(flow) = flow else {
            let failure = Failure::new(
                "unknown_flow",
                format!("flow '{}' does not exist", run.flow_name()),
            );
            return self.finish_failed(run, None, failure).await;
        };

        let unit = match self.registry.resolve(&flow) {
            Ok(unit) => unit,
            Err(failure) => return self.finish_failed(run, Some(flow), failure).await,
        };

        let cursor: Option<Value> = run.progress().current_cursor().cloned();
        let run_id = run.id();
        let flow = Arc::new(flow);
        let shared = Arc::new(Mutex::new(run));
        let repo: Arc<dyn RunRepository> = self.repo.clone();
        let ctx = RunContext::new(run_id, flow.clone(), shared.clone(), repo);

        debug!(has_cursor = cursor.is_some(), "Invoking processing unit");

        // A separate task, so a panicking unit cannot take the executor down with it.
        let mut task =
            tokio::spawn(async move { unit.process(ctx, cursor).await }.in_current_span());

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = heartbeat.tick() => self.heartbeat(&shared).await,
            }
        };

        let outcome = joined.unwrap_or_else(|join_error| {
            if join_error.is_panic() {
                Err(Failure::from_panic(join_error.into_panic()))
            } else {
                Err(Failure::new("cancelled", "processing unit task was cancelled"))
            }
        });

        let run = shared.lock().await.clone();
        let flow = Arc::unwrap_or_clone(flow);
        match outcome {
            Ok(()) => self.finish_succeeded(run, flow).await,
            Err(failure) => self.finish_failed(run, Some(flow), failure).await,
        }
    }

    /// Refreshes `updated_at` on a running run so stall detection leaves it alone.
    async fn heartbeat(&self, shared: &Mutex<Run>) {
        let now = Utc::now();
        let (run_id, claimant) = {
            let mut run = shared.lock().await;
            // Later progress saves must not move the timestamp backwards.
            run.updated_at = now;
            (run.id(), run.claimed_by.clone())
        };
        match self.repo.touch(run_id, claimant.as_deref(), now).await {
            Ok(true) => debug!("Heartbeat"),
            Ok(false) => warn!("Run is no longer in progress under this worker"),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    /// Refuses to start a run while another run of the same flow is in progress
    /// anywhere, not only in this process.
    async fn ensure_no_active_run(&self, run: &Run, key: &str) -> Result<()> {
        let busy = self
            .repo
            .find_active(run.flow_name())
            .await?
            .iter()
            .any(|other| other.id() != run.id() && other.status() == RunStatus::InProgress);
        if busy {
            return Err(ExecutionError::ConcurrentExecution {
                flow: run.flow_name().to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn finish_succeeded(&self, mut run: Run, flow: Flow) -> Result<Run> {
        run.complete(Utc::now())?;
        self.repo.save(&run).await?;
        info!(
            records = run.records_processed().unwrap_or(0),
            duration_ms = run.duration().map(|d| d.num_milliseconds()).unwrap_or(0),
            "Run succeeded"
        );
        self.record_flow_outcome(&run, Some(flow)).await;
        Ok(run)
    }

    async fn finish_failed(&self, mut run: Run, flow: Option<Flow>, failure: Failure) -> Result<Run> {
        run.metadata
            .insert(ERROR_KIND_KEY.to_string(), Value::String(failure.kind.clone()));
        if !failure.details.is_empty() {
            let details = failure.details.clone().into_iter().collect();
            run.metadata
                .insert(ERROR_DETAILS_KEY.to_string(), Value::Object(details));
        }
        run.fail(
            Utc::now(),
            failure.message.clone(),
            failure.backtrace.as_deref(),
            self.config.backtrace_frames,
        )?;
        self.repo.save(&run).await?;
        error!(kind = %failure.kind, "Run failed: {}", failure.message);

        self.record_flow_outcome(&run, flow).await;
        Err(ExecutionError::ExecutionFailure {
            run_id: run.id(),
            kind: failure.kind,
            message: failure.message,
        })
    }

    async fn record_flow_outcome(&self, run: &Run, flow: Option<Flow>) {
        let Some(mut flow) = flow else { return };
        // Reload so a concurrent edit of the flow's config is not overwritten.
        if let Ok(Some(current)) = self.repo.get_flow(&flow.name).await {
            flow = current;
        }
        flow.record_outcome(run.status(), run.ended_at().unwrap_or_else(Utc::now));
        if let Err(e) = self.repo.save_flow(&flow).await {
            warn!("Failed to record outcome on flow {}: {}", flow.name, e);
        }
    }

    /// Starts a new run that continues where `run_id` stopped.
    ///
    /// The previous run must be failed or cancelled and stays as it is. The
    /// new run carries its progress, so the unit receives the saved cursor.
    pub async fn redispatch(&self, run_id: Uuid) -> Result<Run> {
        let previous = self.load(run_id).await?;
        if !matches!(previous.status(), RunStatus::Failed | RunStatus::Cancelled) {
            return Err(ExecutionError::InvalidTransition(
                CoreError::InvalidTransition {
                    run_id,
                    from: previous.status().as_str(),
                    event: "redispatch",
                },
            ));
        }

        let retry = Run::retry_of(&previous, Utc::now());
        self.repo.save(&retry).await?;
        info!(
            "Re-dispatching run {} as {} for flow {}",
            run_id,
            retry.id(),
            retry.flow_name()
        );
        self.execute(retry).await
    }

    /// Cancels a pending run.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run> {
        let mut run = self.load(run_id).await?;
        run.cancel(Utc::now())?;
        self.repo.save(&run).await?;
        info!("Cancelled run {}", run_id);
        Ok(run)
    }

    /// Marks an abandoned in-progress run as cancelled.
    ///
    /// Nothing is delivered to a unit that may still be running it.
    pub async fn force_cancel(&self, run_id: Uuid) -> Result<Run> {
        let mut run = self.load(run_id).await?;
        run.force_cancel(Utc::now())?;
        self.repo.save(&run).await?;
        warn!("Force-cancelled in-progress run {}", run_id);
        Ok(run)
    }

    async fn load(&self, run_id: Uuid) -> Result<Run> {
        self.repo
            .get(run_id)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(run_id).into())
    }
}
