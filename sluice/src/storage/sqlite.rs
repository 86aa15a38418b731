use super::{
    error::Result, error::StorageError, from_millis, from_millis_opt, PoolConfig, RunRepository,
};
use crate::core::{Flow, FlowStatus, Run, RunStatus, RuntimeConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, flow_name, status, scheduled_at, started_at, ended_at,
     error_message, error_backtrace, records_processed, metadata,
     created_at, updated_at, claimed_by, claimed_at";

/// SQLite-backed run repository with connection pooling.
///
/// Timestamps are stored as epoch milliseconds, metadata and flow configs as
/// JSON text. Discovery claims with a single `UPDATE ... RETURNING`
/// (SQLite 3.35+), so no two callers can claim the same row.
pub struct SqliteRunRepository {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteRunRepository {
    /// Opens (creating if missing) the database at `db_path` with default pool settings.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, PoolConfig::default()).await
    }

    pub async fn with_config(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path_str))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = Self::build_pool(connect_options, &config).await?;
        let repo = Self {
            pool,
            db_path: db_path_str,
        };
        repo.initialize().await?;
        Ok(repo)
    }

    /// An in-memory database.
    ///
    /// Uses a single connection, since every `sqlite::memory:` connection
    /// would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Memory)
            .synchronous(SqliteSynchronous::Normal);

        // Closing the only connection would drop the database with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let repo = Self {
            pool,
            db_path: ":memory:".to_string(),
        };
        repo.initialize().await?;
        Ok(repo)
    }

    async fn build_pool(
        connect_options: SqliteConnectOptions,
        config: &PoolConfig,
    ) -> Result<Pool<Sqlite>> {
        let mut builder = SqlitePoolOptions::new()
            .max_connections(config.max_size)
            .acquire_timeout(config.connection_timeout);

        if let Some(min_idle) = config.min_idle {
            builder = builder.min_connections(min_idle);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            builder = builder.max_lifetime(max_lifetime);
        }
        if let Some(idle_timeout) = config.idle_timeout {
            builder = builder.idle_timeout(idle_timeout);
        }

        builder
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flows (
                name TEXT PRIMARY KEY,
                processor TEXT NOT NULL,
                source_config TEXT NOT NULL,
                sink_config TEXT NOT NULL,
                runtime_config TEXT NOT NULL,
                status TEXT CHECK( status IN ('active','inactive') ) NOT NULL,
                last_run_at INTEGER,
                last_run_status TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                flow_name TEXT NOT NULL,
                status TEXT CHECK( status IN ('pending','in_progress','success','failed','cancelled') ) NOT NULL,
                scheduled_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                error_message TEXT,
                error_backtrace TEXT,
                records_processed INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                claimed_by TEXT,
                claimed_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        // Discovery: pending + due + unclaimed
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_due ON runs(status, scheduled_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(flow_name)")
            .execute(&self.pool)
            .await?;

        debug!("Initialized sqlite run repository at {}", self.db_path);
        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn pool_size(&self) -> u32 {
        self.pool.size()
    }

    fn row_to_run(row: &SqliteRow) -> Result<Run> {
        let id_str: String = row.try_get("id")?;
        let id = Uuid::parse_str(&id_str).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let status_str: String = row.try_get("status")?;
        let metadata_json: String = row.try_get("metadata")?;
        let metadata: Map<String, Value> = serde_json::from_str(&metadata_json)?;

        Ok(Run {
            id,
            flow_name: row.try_get("flow_name")?,
            status: RunStatus::from_str(&status_str)?,
            scheduled_at: from_millis(row.try_get("scheduled_at")?)?,
            started_at: from_millis_opt(row.try_get("started_at")?)?,
            ended_at: from_millis_opt(row.try_get("ended_at")?)?,
            error_message: row.try_get("error_message")?,
            error_backtrace: row.try_get("error_backtrace")?,
            records_processed: row.try_get("records_processed")?,
            metadata,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: from_millis_opt(row.try_get("claimed_at")?)?,
        })
    }

    fn row_to_flow(row: &SqliteRow) -> Result<Flow> {
        let source_config: String = row.try_get("source_config")?;
        let sink_config: String = row.try_get("sink_config")?;
        let runtime_config: String = row.try_get("runtime_config")?;
        let status: String = row.try_get("status")?;
        let last_run_status: Option<String> = row.try_get("last_run_status")?;

        Ok(Flow {
            name: row.try_get("name")?,
            processor: row.try_get("processor")?,
            source_config: serde_json::from_str(&source_config)?,
            sink_config: serde_json::from_str(&sink_config)?,
            runtime_config: serde_json::from_str::<RuntimeConfig>(&runtime_config)?,
            status: FlowStatus::from_str(&status)?,
            last_run_at: from_millis_opt(row.try_get("last_run_at")?)?,
            last_run_status: last_run_status
                .as_deref()
                .map(RunStatus::from_str)
                .transpose()?,
        })
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn save_flow(&self, flow: &Flow) -> Result<()> {
        sqlx::query(
            "INSERT INTO flows (name, processor, source_config, sink_config, runtime_config,
                                status, last_run_at, last_run_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                processor = excluded.processor,
                source_config = excluded.source_config,
                sink_config = excluded.sink_config,
                runtime_config = excluded.runtime_config,
                status = excluded.status,
                last_run_at = excluded.last_run_at,
                last_run_status = excluded.last_run_status",
        )
        .bind(&flow.name)
        .bind(&flow.processor)
        .bind(serde_json::to_string(&flow.source_config)?)
        .bind(serde_json::to_string(&flow.sink_config)?)
        .bind(serde_json::to_string(&flow.runtime_config)?)
        .bind(flow.status.as_str())
        .bind(flow.last_run_at.map(|dt| dt.timestamp_millis()))
        .bind(flow.last_run_status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_flow(&self, name: &str) -> Result<Option<Flow>> {
        sqlx::query("SELECT * FROM flows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_flow(&row))
            .transpose()
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        sqlx::query("SELECT * FROM flows ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_flow)
            .collect()
    }

    async fn save(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, flow_name, status, scheduled_at, started_at, ended_at,
                               error_message, error_backtrace, records_processed, metadata,
                               created_at, updated_at, claimed_by, claimed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                scheduled_at = excluded.scheduled_at,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                error_message = excluded.error_message,
                error_backtrace = excluded.error_backtrace,
                records_processed = excluded.records_processed,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at,
                claimed_by = excluded.claimed_by,
                claimed_at = excluded.claimed_at",
        )
        .bind(run.id.to_string())
        .bind(&run.flow_name)
        .bind(run.status.as_str())
        .bind(run.scheduled_at.timestamp_millis())
        .bind(run.started_at.map(|dt| dt.timestamp_millis()))
        .bind(run.ended_at.map(|dt| dt.timestamp_millis()))
        .bind(&run.error_message)
        .bind(&run.error_backtrace)
        .bind(run.records_processed)
        .bind(serde_json::to_string(&run.metadata)?)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .bind(&run.claimed_by)
        .bind(run.claimed_at.map(|dt| dt.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_all(&self, runs: &[Run]) -> Result<()> {
        // One transaction, so a planned batch is either fully visible or not at all.
        let mut tx = self.pool.begin().await?;
        for run in runs {
            sqlx::query(
                "INSERT OR REPLACE INTO runs (id, flow_name, status, scheduled_at, started_at, ended_at,
                                              error_message, error_backtrace, records_processed, metadata,
                                              created_at, updated_at, claimed_by, claimed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run.id.to_string())
            .bind(&run.flow_name)
            .bind(run.status.as_str())
            .bind(run.scheduled_at.timestamp_millis())
            .bind(run.started_at.map(|dt| dt.timestamp_millis()))
            .bind(run.ended_at.map(|dt| dt.timestamp_millis()))
            .bind(&run.error_message)
            .bind(&run.error_backtrace)
            .bind(run.records_processed)
            .bind(serde_json::to_string(&run.metadata)?)
            .bind(run.created_at.timestamp_millis())
            .bind(run.updated_at.timestamp_millis())
            .bind(&run.claimed_by)
            .bind(run.claimed_at.map(|dt| dt.timestamp_millis()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Saved {} runs", runs.len());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_run(&row))
            .transpose()
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let now_millis = now.timestamp_millis();

        // Select and claim in one statement, so a concurrent caller's
        // UPDATE never sees these rows as unclaimed.
        let mut runs = sqlx::query(&format!(
            "UPDATE runs
             SET claimed_by = ?1, claimed_at = ?2
             WHERE id IN (
                 SELECT id FROM runs
                 WHERE status = 'pending'
                   AND scheduled_at <= ?2
                   AND claimed_by IS NULL
                 ORDER BY scheduled_at ASC, created_at ASC
                 LIMIT ?3
             )
             RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(claimant)
        .bind(now_millis)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_run)
        .collect::<Result<Vec<_>>>()?;

        // RETURNING order is unspecified.
        runs.sort_by_key(|run| (run.scheduled_at, run.created_at));

        if !runs.is_empty() {
            debug!("Claimed {} due runs for {}", runs.len(), claimant);
        }
        Ok(runs)
    }

    async fn release(&self, id: Uuid, claimant: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET claimed_by = NULL, claimed_at = NULL
             WHERE id = ? AND claimed_by = ?",
        )
        .bind(id.to_string())
        .bind(claimant)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StorageError::RunNotFound(id))
        }
    }

    async fn try_start(
        &self,
        id: Uuid,
        from: RunStatus,
        claimant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        if !matches!(from, RunStatus::Pending | RunStatus::InProgress) {
            return Ok(None);
        }
        sqlx::query(&format!(
            "UPDATE runs
             SET started_at = CASE WHEN status = 'pending' THEN ?1 ELSE started_at END,
                 status = 'in_progress',
                 updated_at = ?1
             WHERE id = ?2 AND status = ?3 AND claimed_by IS ?4
             RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(claimant)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| Self::row_to_run(&row))
        .transpose()
    }

    async fn touch(&self, id: Uuid, claimant: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET updated_at = ?
             WHERE id = ? AND status = 'in_progress' AND claimed_by IS ?",
        )
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .bind(claimant)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_flow(&self, flow_name: &str) -> Result<Vec<Run>> {
        sqlx::query(&format!(
            "SELECT {} FROM runs WHERE flow_name = ? ORDER BY scheduled_at ASC, created_at ASC",
            RUN_COLUMNS
        ))
        .bind(flow_name)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_run)
        .collect()
    }

    async fn find_active(&self, flow_name: &str) -> Result<Vec<Run>> {
        sqlx::query(&format!(
            "SELECT {} FROM runs
             WHERE flow_name = ? AND status IN ('pending', 'in_progress')
             ORDER BY scheduled_at ASC, created_at ASC",
            RUN_COLUMNS
        ))
        .bind(flow_name)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_run)
        .collect()
    }

    async fn find_stalled(
        &self,
        stale_before: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(&format!(
            "UPDATE runs
             SET claimed_by = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id IN (
                 SELECT id FROM runs
                 WHERE status = 'in_progress'
                   AND updated_at < ?3
                   AND json_extract(metadata, '$.cursor') IS NOT NULL
                 ORDER BY updated_at ASC
                 LIMIT ?4
             )
             RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(claimant)
        .bind(now)
        .bind(stale_before.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_run)
        .collect()
    }

    async fn recover_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE runs SET claimed_by = NULL, claimed_at = NULL
             WHERE status = 'pending' AND claimed_at IS NOT NULL AND claimed_at < ?",
        )
        .bind(claimed_before.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Recovered {} stale claims", recovered);
        }
        Ok(recovered)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM runs
             WHERE status IN ('success', 'failed', 'cancelled')
               AND ended_at IS NOT NULL
               AND ended_at < ?",
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        info!("Closed sqlite run repository");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProgressUpdate;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_round_trip() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let now = Utc::now();
        let mut run = Run::new("orders", now);
        run.start(now).unwrap();
        run.update_progress(
            ProgressUpdate::new().step("fetch").cursor(json!({"page": 3})).records(30),
            now,
        );
        repo.save(&run).await.unwrap();

        let loaded = repo.get(run.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), RunStatus::InProgress);
        assert_eq!(loaded.records_processed(), Some(30));
        assert_eq!(loaded.progress().current_cursor(), Some(&json!({"page": 3})));
        assert_eq!(
            loaded.started_at().map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );

        // Upsert, not duplicate.
        run.complete(now).unwrap();
        repo.save(&run).await.unwrap();
        let runs = repo.find_by_flow("orders").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status(), RunStatus::Success);
    }

    #[tokio::test]
    async fn test_flow_round_trip() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let mut flow = Flow::new("orders", "copy")
            .with_source_config(json!({"table": "orders"}))
            .with_runtime_config(RuntimeConfig::cron("*/5 * * * *").in_group("warehouse"));
        flow.record_outcome(RunStatus::Failed, Utc::now());
        repo.save_flow(&flow).await.unwrap();

        let loaded = repo.get_flow("orders").await.unwrap().unwrap();
        assert_eq!(loaded.runtime_config, flow.runtime_config);
        assert_eq!(loaded.source_config, flow.source_config);
        assert_eq!(loaded.last_run_status, Some(RunStatus::Failed));
        assert_eq!(repo.list_flows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_due_claims_once() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let now = Utc::now();
        let first = Run::new("a", now - ChronoDuration::minutes(10));
        let second = Run::new("b", now - ChronoDuration::minutes(5));
        let later = Run::new("c", now + ChronoDuration::minutes(5));
        repo.save_all(&[second.clone(), later, first.clone()]).await.unwrap();

        let claimed = repo.find_due(now, "worker-1", 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(Run::id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert!(repo.find_due(now, "worker-2", 10).await.unwrap().is_empty());

        assert!(!repo.release(first.id(), "worker-2").await.unwrap());
        assert!(repo.release(first.id(), "worker-1").await.unwrap());
        let again = repo.find_due(now, "worker-2", 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].claimed_by(), Some("worker-2"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let repo = Arc::new(SqliteRunRepository::in_memory().await.unwrap());
        let now = Utc::now();
        let runs: Vec<Run> = (0..50)
            .map(|i| Run::new(format!("flow-{}", i), now - ChronoDuration::seconds(i)))
            .collect();
        repo.save_all(&runs).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = repo
                        .find_due(Utc::now(), &format!("worker-{}", worker), 5)
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|r| r.id()));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "run {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn test_stalled_and_stale_claims() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let long_ago = Utc::now() - ChronoDuration::hours(1);

        let mut stalled = Run::new("orders", long_ago);
        stalled.start(long_ago).unwrap();
        stalled.update_progress(ProgressUpdate::new().cursor(7), long_ago);
        let pending = Run::new("invoices", long_ago);
        repo.save_all(&[stalled.clone(), pending.clone()]).await.unwrap();

        let found = repo
            .find_stalled(Utc::now() - ChronoDuration::minutes(15), "w", 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), stalled.id());

        repo.find_due(Utc::now(), "dead", 10).await.unwrap();
        let recovered = repo
            .recover_stale_claims(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(repo.find_due(Utc::now(), "live", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let old = Utc::now() - ChronoDuration::days(40);
        let mut done = Run::new("orders", old);
        done.start(old).unwrap();
        done.fail(old, "boom", None, 5).unwrap();
        let fresh = Run::new("orders", Utc::now());
        repo.save_all(&[done, fresh]).await.unwrap();

        let deleted = repo
            .delete_older_than(Utc::now() - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.find_by_flow("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_try_start_is_compare_and_set() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let now = Utc::now();
        let run = Run::new("orders", now - ChronoDuration::minutes(1));
        repo.save(&run).await.unwrap();
        repo.find_due(now, "w1", 10).await.unwrap();

        // Wrong claimant, wrong status: nothing moves.
        assert!(repo
            .try_start(run.id(), RunStatus::Pending, Some("w2"), now)
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .try_start(run.id(), RunStatus::Pending, None, now)
            .await
            .unwrap()
            .is_none());

        let started = repo
            .try_start(run.id(), RunStatus::Pending, Some("w1"), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.status(), RunStatus::InProgress);
        assert_eq!(
            started.started_at().map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );

        // A second starter holding the same stale pending copy loses.
        assert!(repo
            .try_start(run.id(), RunStatus::Pending, Some("w1"), now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_touch_only_refreshes_owned_in_progress_runs() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let start = Utc::now() - ChronoDuration::minutes(30);
        let mut run = Run::new("orders", start);
        run.start(start).unwrap();
        run.update_progress(ProgressUpdate::new().cursor(1), start);
        repo.save(&run).await.unwrap();

        let later = Utc::now();
        assert!(!repo.touch(run.id(), Some("other"), later).await.unwrap());
        assert!(repo.touch(run.id(), None, later).await.unwrap());
        let loaded = repo.get(run.id()).await.unwrap().unwrap();
        assert_eq!(loaded.updated_at().timestamp_millis(), later.timestamp_millis());

        // A heartbeated run is not stalled.
        let stalled = repo
            .find_stalled(later - ChronoDuration::minutes(15), "w", 10)
            .await
            .unwrap();
        assert!(stalled.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_an_error() {
        let repo = SqliteRunRepository::in_memory().await.unwrap();
        let run = Run::new("orders", Utc::now());
        repo.save(&run).await.unwrap();

        sqlx::query("UPDATE runs SET scheduled_at = ? WHERE id = ?")
            .bind(i64::MAX)
            .bind(run.id().to_string())
            .execute(&repo.pool)
            .await
            .unwrap();

        assert!(matches!(
            repo.get(run.id()).await,
            Err(StorageError::Corrupt(_))
        ));
    }
}
