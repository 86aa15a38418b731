//! Run discovery and the background scheduling loop.
//!
//! A sweep claims due runs through the repository's skip-locked discovery
//! and hands each one to the [`Executor`]. Any number of schedulers may sweep
//! the same store; they coordinate only through that claim.
//!
//! A failure local to one run never aborts the sweep. A failure of the
//! discovery query itself does, and is returned to the caller.

use super::concurrency::{DispatchMode, DispatchTicket};
use super::error::{ExecutionError, Result};
use super::run_executor::Executor;
use crate::config::SchedulerConfig;
use crate::core::{Flow, Run, RunStatus};
use crate::storage::RunRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Counts for one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub processed: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Runs skipped because their flow was busy. They stay pending.
    pub deferred_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl SweepSummary {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            processed: 0,
            success_count: 0,
            error_count: 0,
            deferred_count: 0,
            timestamp,
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Succeeded => self.success_count += 1,
            Outcome::Failed => self.error_count += 1,
            Outcome::Deferred => self.deferred_count += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Succeeded,
    Failed,
    Deferred,
}

/// Discovers due runs and executes them.
pub struct Scheduler<R: RunRepository + 'static> {
    repo: Arc<R>,
    executor: Executor<R>,
    config: SchedulerConfig,
}

impl<R: RunRepository + 'static> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            executor: self.executor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: RunRepository + 'static> Scheduler<R> {
    /// Creates a scheduler sharing the executor's repository.
    pub fn new(executor: Executor<R>, config: SchedulerConfig) -> Self {
        Self {
            repo: executor.repository().clone(),
            executor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor<R> {
        &self.executor
    }

    /// One sweep: claim due runs and execute each of them.
    pub async fn run_due_flows(&self) -> Result<SweepSummary> {
        let now = Utc::now();
        let claimed = self
            .repo
            .find_due(now, &self.config.claimant_id, self.config.batch_size)
            .await
            .map_err(|e| {
                error!("Run discovery failed: {}", e);
                ExecutionError::Dependency(e.to_string())
            })?;

        for run in claimed.iter() {
            if run.is_overdue(now, self.config.overdue_threshold) {
                warn!(
                    "Run {} of flow {} is overdue (scheduled at {})",
                    run.id(),
                    run.flow_name(),
                    run.scheduled_at()
                );
            }
        }

        let summary = self.execute_all(claimed, now).await;
        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                succeeded = summary.success_count,
                failed = summary.error_count,
                deferred = summary.deferred_count,
                "Sweep finished"
            );
        }
        Ok(summary)
    }

    async fn execute_all(&self, runs: Vec<Run>, timestamp: DateTime<Utc>) -> SweepSummary {
        let mut summary = SweepSummary::new(timestamp);

        if self.config.max_parallel <= 1 {
            for run in runs {
                summary.record(self.execute_claimed(run).await);
            }
            return summary;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut tasks = JoinSet::new();
        for run in runs {
            let scheduler = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                // Held for the whole execution.
                let _permit = permits.acquire_owned().await.ok();
                scheduler.execute_claimed(run).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!("Sweep task ended abnormally: {}", e);
                    summary.record(Outcome::Failed);
                }
            }
        }
        summary
    }

    async fn execute_claimed(&self, run: Run) -> Outcome {
        let run_id = run.id();
        match self.executor.execute(run).await {
            Ok(_) => Outcome::Succeeded,
            Err(e) if e.is_deferral() => {
                debug!("Deferring run {}: {}", run_id, e);
                match self.repo.release(run_id, &self.config.claimant_id).await {
                    Ok(true) => {}
                    Ok(false) => debug!("Claim on run {} already moved to another worker", run_id),
                    Err(e) => warn!("Failed to release claim on run {}: {}", run_id, e),
                }
                Outcome::Deferred
            }
            Err(e @ ExecutionError::ExecutionFailure { .. }) => {
                // Already recorded on the run by the executor.
                warn!("{}", e);
                Outcome::Failed
            }
            Err(e) => {
                error!("Run {} could not be executed: {}", run_id, e);
                self.record_failure(run_id, &e).await;
                Outcome::Failed
            }
        }
    }

    /// Best effort: a started run is failed, an unstarted one is released.
    /// Runs claimed by another worker are left alone.
    async fn record_failure(&self, run_id: Uuid, cause: &ExecutionError) {
        let run = match self.repo.get(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not reload run {} to record failure: {}", run_id, e);
                return;
            }
        };

        // Someone else's run now; theirs to finish.
        if run.claimed_by() != Some(self.config.claimant_id.as_str()) {
            return;
        }

        let result = match run.status() {
            RunStatus::InProgress => {
                let mut run = run;
                match run.fail(Utc::now(), cause.to_string(), None, 0) {
                    Ok(()) => self.repo.save(&run).await,
                    Err(_) => Ok(()),
                }
            }
            RunStatus::Pending => self
                .repo
                .release(run_id, &self.config.claimant_id)
                .await
                .map(|_| ()),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Could not record failure on run {}: {}", run_id, e);
        }
    }

    /// Deletes terminal runs that ended more than `older_than` ago.
    pub async fn cleanup_old_runs(&self, older_than: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| ExecutionError::Dependency(format!("invalid retention: {}", e)))?;
        let cutoff = Utc::now() - age;
        let deleted = self.repo.delete_older_than(cutoff).await?;
        if deleted > 0 {
            info!("Deleted {} runs that ended before {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Creates the next pending run for each schedulable flow that has none
    /// outstanding.
    pub async fn plan_runs(&self, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let mut planned = Vec::new();
        for flow in self.repo.list_flows().await? {
            if !flow.is_schedulable() {
                continue;
            }
            if !self.repo.find_active(&flow.name).await?.is_empty() {
                continue;
            }
            match flow.next_run_at(now) {
                Ok(Some(at)) => planned.push(Run::new(flow.name.clone(), at)),
                Ok(None) => {}
                Err(e) => warn!("Skipping flow {}: {}", flow.name, e),
            }
        }

        if !planned.is_empty() {
            self.repo.save_all(&planned).await?;
            debug!("Planned {} runs", planned.len());
        }
        Ok(planned)
    }

    /// Plans and persists one pending run per flow, spread according to `mode`.
    pub async fn dispatch(&self, flows: &[Flow], mode: DispatchMode) -> Result<Vec<DispatchTicket>> {
        let tickets = self
            .executor
            .controller()
            .plan_dispatch(flows, mode, Utc::now());
        let runs: Vec<Run> = tickets.iter().map(DispatchTicket::to_run).collect();
        self.repo.save_all(&runs).await?;
        info!("Dispatched {} runs ({:?})", runs.len(), mode);
        Ok(tickets)
    }

    /// Claims and resumes resumable runs whose executor stopped reporting.
    pub async fn resume_stalled(&self) -> Result<SweepSummary> {
        let now = Utc::now();
        let age = chrono::Duration::from_std(self.config.stalled_run_after)
            .map_err(|e| ExecutionError::Dependency(format!("invalid stall threshold: {}", e)))?;
        let stalled = self
            .repo
            .find_stalled(now - age, &self.config.claimant_id, self.config.batch_size)
            .await?;
        for run in stalled.iter() {
            info!("Resuming stalled run {} of flow {}", run.id(), run.flow_name());
        }
        Ok(self.execute_all(stalled, now).await)
    }

    /// Releases claims left behind by schedulers that died before starting their runs.
    pub async fn recover_stale_claims(&self) -> Result<u64> {
        let age = chrono::Duration::from_std(self.config.stale_claim_after)
            .map_err(|e| ExecutionError::Dependency(format!("invalid claim timeout: {}", e)))?;
        Ok(self.repo.recover_stale_claims(Utc::now() - age).await?)
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        self.executor.cancel(run_id).await
    }

    /// One idempotent tick: plan what is due next, then sweep.
    pub async fn trigger(&self) -> Result<SweepSummary> {
        self.plan_runs(Utc::now()).await?;
        self.run_due_flows().await
    }

    /// Starts the scheduling loop in the background.
    ///
    /// Every `tick_interval` it runs [`Scheduler::trigger`]. Every
    /// `stale_claim_after` it recovers orphaned claims and resumes stalled
    /// runs.
    pub fn start(&self) -> SchedulerHandle {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let scheduler = self.clone();
        let claimant_id = self.config.claimant_id.clone();

        info!("Starting scheduler: {}", claimant_id);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(at_least_1ms(scheduler.config.tick_interval));
            let mut maintenance =
                tokio::time::interval(at_least_1ms(scheduler.config.stale_claim_after));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        info!("Scheduler {} received shutdown signal", scheduler.config.claimant_id);
                        break;
                    }

                    _ = tick.tick() => {
                        if let Err(e) = scheduler.trigger().await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }

                    _ = maintenance.tick() => {
                        match scheduler.recover_stale_claims().await {
                            Ok(count) if count > 0 => info!("Recovered {} stale claims", count),
                            Err(e) => warn!("Stale claim recovery failed: {}", e),
                            _ => {}
                        }
                        if let Err(e) = scheduler.resume_stalled().await {
                            warn!("Resuming stalled runs failed: {}", e);
                        }
                    }
                }
            }
        });

        SchedulerHandle {
            claimant_id,
            handle,
            cancellation_token,
        }
    }
}

fn at_least_1ms(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

/// Handle for controlling a running scheduler loop.
pub struct SchedulerHandle {
    claimant_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl SchedulerHandle {
    pub fn claimant_id(&self) -> &str {
        &self.claimant_id
    }

    /// Token for deriving child tokens that stop with the scheduler.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stops the loop and waits for the current tick to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the loop immediately. A run in the middle of execution stays
    /// in progress and is picked up again by stalled-run resumption.
    pub fn abort(&self) {
        self.handle.abort();
    }
}
