use super::diagnostics::bounded_backtrace;
use super::error::{CoreError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How long past its `scheduled_at` a pending run may sit before it counts as overdue.
pub const OVERDUE_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Lifecycle status of a [`Run`].
///
/// Legal moves: `Pending -> InProgress -> {Success, Failed}`,
/// `Pending -> Cancelled`, and the operator-only `InProgress -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true for `Success`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// One scheduled execution of a flow.
///
/// Status changes only go through the transition methods below, so the
/// "set exactly once" rules for `started_at` and `ended_at` hold by
/// construction. Progress metadata lives in `metadata` (see [`super::Progress`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub(crate) id: Uuid,
    pub(crate) flow_name: String,
    pub(crate) status: RunStatus,
    pub(crate) scheduled_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) error_message: Option<String>,
    pub(crate) error_backtrace: Option<String>,
    pub(crate) records_processed: Option<i64>,
    #[serde(default)]
    pub(crate) metadata: Map<String, Value>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    /// Identity of the scheduler instance holding the discovery claim.
    #[serde(default)]
    pub(crate) claimed_by: Option<String>,
    #[serde(default)]
    pub(crate) claimed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates a pending run for `flow_name` that becomes due at `scheduled_at`.
    pub fn new(flow_name: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_name: flow_name.into(),
            status: RunStatus::Pending,
            scheduled_at,
            started_at: None,
            ended_at: None,
            error_message: None,
            error_backtrace: None,
            records_processed: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Creates a fresh pending run that continues where `previous` stopped.
    ///
    /// The progress metadata is carried over, `resumptions` is incremented and
    /// `resumed_from` points at the previous run. `previous` itself is not
    /// touched: a failed run stays failed.
    pub fn retry_of(previous: &Run, now: DateTime<Utc>) -> Self {
        let mut run = Run::new(previous.flow_name.clone(), now);
        run.metadata = previous.metadata.clone();
        run.records_processed = previous.records_processed;
        let resumptions = previous.progress().resumptions().unwrap_or(0) + 1;
        run.metadata
            .insert(super::progress::RESUMPTIONS_KEY.to_string(), resumptions.into());
        run.metadata.insert(
            super::progress::RESUMED_FROM_KEY.to_string(),
            Value::String(previous.id.to_string()),
        );
        run
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error_backtrace(&self) -> Option<&str> {
        self.error_backtrace.as_deref()
    }

    pub fn records_processed(&self) -> Option<i64> {
        self.records_processed
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn claimed_by(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    /// Wall time between start and end, present only once both are recorded.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => Some(ended - started),
            _ => None,
        }
    }

    // ===== Predicates =====

    pub fn is_pending(&self) -> bool {
        self.status == RunStatus::Pending
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.scheduled_at <= now
    }

    pub fn is_overdue(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        let Some(cutoff) = Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
        else {
            return false;
        };
        self.is_due(now) && self.scheduled_at <= cutoff
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// An in-progress run that recorded a cursor can be continued instead of restarted.
    pub fn is_resumable(&self) -> bool {
        self.status == RunStatus::InProgress && self.progress().current_cursor().is_some()
    }

    // ===== Transitions =====

    /// `pending -> in_progress`. Stamps `started_at`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(RunStatus::Pending, "start")?;
        self.status = RunStatus::InProgress;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `in_progress -> success`. Stamps `ended_at`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(RunStatus::InProgress, "complete")?;
        self.status = RunStatus::Success;
        self.finish(now);
        Ok(())
    }

    /// `in_progress -> failed`. Stores the message and at most `frames` backtrace frames.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
        backtrace: Option<&str>,
        frames: usize,
    ) -> Result<()> {
        self.require(RunStatus::InProgress, "fail")?;
        self.status = RunStatus::Failed;
        self.error_message = Some(message.into());
        self.error_backtrace = backtrace
            .map(|bt| bounded_backtrace(bt, frames))
            .filter(|bt| !bt.is_empty());
        self.finish(now);
        Ok(())
    }

    /// `pending -> cancelled`. The operator-facing cancellation.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(RunStatus::Pending, "cancel")?;
        self.status = RunStatus::Cancelled;
        self.finish(now);
        Ok(())
    }

    /// `in_progress -> cancelled`.
    ///
    /// Marks an abandoned in-progress record as cancelled. Nothing is
    /// delivered to a unit that may still be running.
    pub fn force_cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(RunStatus::InProgress, "force_cancel")?;
        self.status = RunStatus::Cancelled;
        self.finish(now);
        Ok(())
    }

    fn require(&self, expected: RunStatus, event: &'static str) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                run_id: self.id,
                from: self.status.as_str(),
                event,
            })
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.updated_at = now;
        self.release_claim();
    }

    // ===== Claims (storage only) =====

    pub(crate) fn claim(&mut self, claimant: &str, now: DateTime<Utc>) {
        self.claimed_by = Some(claimant.to_string());
        self.claimed_at = Some(now);
    }

    pub(crate) fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// Claims a stalled in-progress run and marks it as alive again.
    pub(crate) fn reclaim_stalled(&mut self, claimant: &str, now: DateTime<Utc>) {
        self.claim(claimant, now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProgressUpdate;

    fn pending_run() -> Run {
        Run::new("orders", Utc::now() - Duration::minutes(1))
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::InProgress,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut run = pending_run();
        let t0 = Utc::now();
        run.start(t0).unwrap();
        assert_eq!(run.status(), RunStatus::InProgress);
        assert_eq!(run.started_at(), Some(t0));
        assert!(run.ended_at().is_none());

        let t1 = t0 + Duration::seconds(3);
        run.complete(t1).unwrap();
        assert_eq!(run.status(), RunStatus::Success);
        assert_eq!(run.ended_at(), Some(t1));
        assert!(run.is_completed());
    }

    #[test]
    fn test_second_start_is_rejected_and_leaves_started_at() {
        let mut run = pending_run();
        let t0 = Utc::now();
        run.start(t0).unwrap();

        let err = run.start(t0 + Duration::seconds(10)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { event: "start", .. }));
        assert_eq!(run.started_at(), Some(t0));
        assert_eq!(run.status(), RunStatus::InProgress);
    }

    #[test]
    fn test_illegal_transitions() {
        let now = Utc::now();

        // complete/fail straight from pending
        let mut run = pending_run();
        assert!(run.complete(now).is_err());
        assert!(run.fail(now, "boom", None, 5).is_err());
        assert!(run.force_cancel(now).is_err());

        // no way back out of a terminal state
        let mut done = pending_run();
        done.start(now).unwrap();
        done.complete(now).unwrap();
        assert!(done.start(now).is_err());
        assert!(done.fail(now, "late", None, 5).is_err());
        assert!(done.cancel(now).is_err());
        assert!(done.complete(now).is_err());

        // cancel requires pending
        let mut running = pending_run();
        running.start(now).unwrap();
        assert!(running.cancel(now).is_err());
    }

    #[test]
    fn test_cancel_paths() {
        let now = Utc::now();
        let mut run = pending_run();
        run.cancel(now).unwrap();
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert_eq!(run.ended_at(), Some(now));
        assert!(run.started_at().is_none());
        assert!(run.duration().is_none());

        let mut abandoned = pending_run();
        abandoned.start(now).unwrap();
        abandoned.force_cancel(now + Duration::seconds(1)).unwrap();
        assert_eq!(abandoned.status(), RunStatus::Cancelled);
        assert_eq!(abandoned.duration(), Some(Duration::seconds(1)));
    }

    #[test]
    fn test_fail_records_message_and_bounded_backtrace() {
        let mut run = pending_run();
        let now = Utc::now();
        run.start(now).unwrap();

        let backtrace = (0..30)
            .map(|i| format!("{:>4}: frame_{}\n             at src/lib.rs:{}", i, i, i))
            .collect::<Vec<_>>()
            .join("\n");
        run.fail(now, "connection reset", Some(&backtrace), 3).unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error_message(), Some("connection reset"));
        let stored = run.error_backtrace().unwrap();
        assert!(stored.contains("frame_2"));
        assert!(!stored.contains("frame_3"));
    }

    #[test]
    fn test_duration_requires_both_ends_and_is_stable() {
        let mut run = pending_run();
        assert!(run.duration().is_none());

        let t0 = Utc::now();
        run.start(t0).unwrap();
        assert!(run.duration().is_none());

        run.complete(t0 + Duration::milliseconds(1500)).unwrap();
        let first = run.duration().unwrap();
        assert_eq!(first, Duration::milliseconds(1500));

        // Rejected transitions after the fact cannot move either end.
        let _ = run.complete(t0 + Duration::hours(1));
        let _ = run.fail(t0 + Duration::hours(1), "late", None, 1);
        assert_eq!(run.duration(), Some(first));
    }

    #[test]
    fn test_due_and_overdue() {
        let now = Utc::now();

        let future = Run::new("orders", now + Duration::minutes(5));
        assert!(!future.is_due(now));
        assert!(!future.is_overdue(now, OVERDUE_THRESHOLD));

        let recent = Run::new("orders", now - Duration::minutes(5));
        assert!(recent.is_due(now));
        assert!(!recent.is_overdue(now, OVERDUE_THRESHOLD));

        let stale = Run::new("orders", now - Duration::hours(2));
        assert!(stale.is_due(now));
        assert!(stale.is_overdue(now, OVERDUE_THRESHOLD));

        // boundary: scheduled exactly now is due
        let exact = Run::new("orders", now);
        assert!(exact.is_due(now));

        let mut started = Run::new("orders", now - Duration::hours(2));
        started.start(now).unwrap();
        assert!(!started.is_due(now));
        assert!(!started.is_overdue(now, OVERDUE_THRESHOLD));
    }

    #[test]
    fn test_resumable_needs_in_progress_and_cursor() {
        let now = Utc::now();
        let mut run = pending_run();
        run.update_progress(ProgressUpdate::new().cursor(10), now);
        assert!(!run.is_resumable(), "pending runs are due, not resumable");

        run.start(now).unwrap();
        assert!(run.is_resumable());

        let mut no_cursor = pending_run();
        no_cursor.start(now).unwrap();
        no_cursor.update_progress(ProgressUpdate::new().step("fetch"), now);
        assert!(!no_cursor.is_resumable());
    }

    #[test]
    fn test_retry_of_carries_progress_forward() {
        let now = Utc::now();
        let mut failed = pending_run();
        failed.start(now).unwrap();
        failed.update_progress(ProgressUpdate::new().step("load").cursor(10).records(40), now);
        failed.fail(now, "boom", None, 5).unwrap();

        let retry = Run::retry_of(&failed, now);
        assert_ne!(retry.id(), failed.id());
        assert!(retry.is_pending());
        assert_eq!(retry.flow_name(), failed.flow_name());
        assert_eq!(retry.progress().current_cursor(), Some(&Value::from(10)));
        assert_eq!(retry.progress().current_step(), Some("load"));
        assert_eq!(retry.progress().resumptions(), Some(1));
        assert_eq!(retry.progress().resumed_from(), Some(failed.id()));
        assert_eq!(failed.status(), RunStatus::Failed);
    }
}
