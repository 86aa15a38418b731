//! Storage layer for the sluice run orchestrator.
//!
//! A trait-based interface for persisting flows and runs, with three
//! backends:
//!
//! - [`InMemoryRunRepository`]: DashMap-backed storage for tests and single-process use
//! - [`SqliteRunRepository`]: persistent SQLite storage (feature `sqlite`, on by default)
//! - [`PostgresRunRepository`]: Postgres storage for multi-process deployments (feature `postgres`)
//!
//! The backend is chosen once, at process start, through [`open`].
//!
//! # Example
//!
//! ```no_run
//! use sluice::storage::{InMemoryRunRepository, RunRepository};
//! use sluice::core::Run;
//! use chrono::Utc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = InMemoryRunRepository::new();
//! repo.save(&Run::new("orders", Utc::now())).await?;
//! let claimed = repo.find_due(Utc::now(), "worker-1", 10).await?;
//! assert_eq!(claimed.len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StorageError};
pub use memory::InMemoryRunRepository;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRunRepository;

#[cfg(feature = "postgres")]
pub use postgres::PostgresRunRepository;

use crate::core::{Flow, Run, RunStatus};

/// Trait for run storage backends.
///
/// Implementations must be thread-safe. Every method is a single atomic
/// operation against the backend; callers never hold locks across calls.
#[async_trait]
pub trait RunRepository: Send + Sync {
    // ===== Flows =====

    /// Insert or replace a flow, keyed by name.
    async fn save_flow(&self, flow: &Flow) -> Result<()>;

    async fn get_flow(&self, name: &str) -> Result<Option<Flow>>;

    async fn list_flows(&self) -> Result<Vec<Flow>>;

    // ===== Runs =====

    /// Insert or replace a run, keyed by id. Saving the same run twice is a no-op.
    async fn save(&self, run: &Run) -> Result<()>;

    /// Save many runs at once.
    async fn save_all(&self, runs: &[Run]) -> Result<()> {
        for run in runs {
            self.save(run).await?;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>>;

    /// Atomically claim up to `limit` due, unclaimed pending runs for `claimant`.
    ///
    /// Runs are returned oldest `scheduled_at` first. Rows another caller is
    /// claiming at the same moment are skipped rather than waited on, so two
    /// concurrent callers never receive the same run.
    async fn find_due(&self, now: DateTime<Utc>, claimant: &str, limit: usize)
        -> Result<Vec<Run>>;

    /// Drop `claimant`'s discovery claim on a run so a later sweep can pick it again.
    ///
    /// Returns `false` when the run is not claimed by `claimant`; a claim
    /// another worker took over is left alone.
    async fn release(&self, id: Uuid, claimant: &str) -> Result<bool>;

    /// Compare-and-set start of a run against the stored row.
    ///
    /// Succeeds only while the stored run still has status `from` and is
    /// claimed by `claimant` (`None` meaning unclaimed). A pending run moves
    /// to `in_progress` with `started_at = now`; an in-progress run being
    /// resumed only gets `updated_at = now`. Returns the stored run after the
    /// update, or `None` when the stored row no longer matches.
    async fn try_start(
        &self,
        id: Uuid,
        from: RunStatus,
        claimant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>>;

    /// Heartbeat for a running run: sets `updated_at = now` while the run is
    /// still in progress under `claimant`. Returns `false` when it is not.
    async fn touch(&self, id: Uuid, claimant: Option<&str>, now: DateTime<Utc>) -> Result<bool>;

    async fn find_by_flow(&self, flow_name: &str) -> Result<Vec<Run>>;

    /// Pending and in-progress runs of a flow.
    async fn find_active(&self, flow_name: &str) -> Result<Vec<Run>> {
        Ok(self
            .find_by_flow(flow_name)
            .await?
            .into_iter()
            .filter(|run| matches!(run.status(), RunStatus::Pending | RunStatus::InProgress))
            .collect())
    }

    /// Claim resumable in-progress runs that have not been touched since
    /// `stale_before`. Claimed runs get a fresh `updated_at`.
    async fn find_stalled(
        &self,
        stale_before: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>>;

    /// Un-claim pending runs whose claim is older than `claimed_before`.
    ///
    /// Returns how many runs became due again.
    async fn recover_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    /// Delete terminal runs that ended before `cutoff`. Returns the number deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

// Type-erased storage, so the backend can be chosen at runtime.
#[async_trait]
impl RunRepository for Box<dyn RunRepository> {
    async fn save_flow(&self, flow: &Flow) -> Result<()> {
        (**self).save_flow(flow).await
    }

    async fn get_flow(&self, name: &str) -> Result<Option<Flow>> {
        (**self).get_flow(name).await
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        (**self).list_flows().await
    }

    async fn save(&self, run: &Run) -> Result<()> {
        (**self).save(run).await
    }

    async fn save_all(&self, runs: &[Run]) -> Result<()> {
        (**self).save_all(runs).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        (**self).get(id).await
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        (**self).find_due(now, claimant, limit).await
    }

    async fn release(&self, id: Uuid, claimant: &str) -> Result<bool> {
        (**self).release(id, claimant).await
    }

    async fn try_start(
        &self,
        id: Uuid,
        from: RunStatus,
        claimant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        (**self).try_start(id, from, claimant, now).await
    }

    async fn touch(&self, id: Uuid, claimant: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        (**self).touch(id, claimant, now).await
    }

    async fn find_by_flow(&self, flow_name: &str) -> Result<Vec<Run>> {
        (**self).find_by_flow(flow_name).await
    }

    async fn find_active(&self, flow_name: &str) -> Result<Vec<Run>> {
        (**self).find_active(flow_name).await
    }

    async fn find_stalled(
        &self,
        stale_before: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        (**self).find_stalled(stale_before, claimant, limit).await
    }

    async fn recover_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        (**self).recover_stale_claims(claimed_before).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        (**self).delete_older_than(cutoff).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Decodes an epoch-millisecond column.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", millis)))
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn from_millis_opt(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

/// Configuration for a sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(30),
            max_lifetime: None,
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
        }
    }
}

/// Which backend to open.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Memory,
    Sqlite { path: String },
    Postgres { url: String, pool: PoolConfig },
}

/// Opens the configured backend.
///
/// Selecting a backend whose cargo feature is disabled is an
/// [`StorageError::InvalidParameter`].
pub async fn open(config: &BackendConfig) -> Result<Box<dyn RunRepository>> {
    match config {
        BackendConfig::Memory => Ok(Box::new(InMemoryRunRepository::new())),

        #[cfg(feature = "sqlite")]
        BackendConfig::Sqlite { path } => {
            let repo = if path == ":memory:" {
                SqliteRunRepository::in_memory().await?
            } else {
                SqliteRunRepository::new(path).await?
            };
            Ok(Box::new(repo))
        }

        #[cfg(not(feature = "sqlite"))]
        BackendConfig::Sqlite { .. } => Err(StorageError::InvalidParameter(
            "sqlite backend requires the `sqlite` feature".to_string(),
        )),

        #[cfg(feature = "postgres")]
        BackendConfig::Postgres { url, pool } => Ok(Box::new(
            PostgresRunRepository::with_config(url, pool.clone()).await?,
        )),

        #[cfg(not(feature = "postgres"))]
        BackendConfig::Postgres { .. } => Err(StorageError::InvalidParameter(
            "postgres backend requires the `postgres` feature".to_string(),
        )),
    }
}
