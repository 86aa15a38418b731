use super::{error::Result, error::StorageError, RunRepository};
use crate::core::{Flow, Run, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// In-memory run repository using DashMap for concurrent access.
///
/// Claims are made atomic per entry: discovery collects candidate ids first,
/// then re-checks each candidate under its shard's write lock (`get_mut`)
/// before claiming it. A candidate that changed in between is skipped, which
/// is the in-process equivalent of `SKIP LOCKED`.
///
/// Only suitable for a single process, since nothing is shared across
/// processes.
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, Run>,
    flows: DashMap<String, Flow>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently stored.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Ids of runs matching `predicate`, ordered by `scheduled_at` then `created_at`.
    ///
    /// Entry guards are dropped before returning so callers can take write
    /// locks on the same shards.
    fn candidates(&self, predicate: impl Fn(&Run) -> bool) -> Vec<Uuid> {
        let mut matching: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = self
            .runs
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| (entry.scheduled_at, entry.created_at, entry.id))
            .collect();
        matching.sort();
        matching.into_iter().map(|(_, _, id)| id).collect()
    }
}

fn is_claimable(run: &Run, now: DateTime<Utc>) -> bool {
    run.is_due(now) && run.claimed_by.is_none()
}

fn is_stalled(run: &Run, stale_before: DateTime<Utc>) -> bool {
    run.is_resumable() && run.updated_at < stale_before
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save_flow(&self, flow: &Flow) -> Result<()> {
        self.flows.insert(flow.name.clone(), flow.clone());
        Ok(())
    }

    async fn get_flow(&self, name: &str) -> Result<Option<Flow>> {
        Ok(self.flows.get(name).map(|entry| entry.value().clone()))
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        let mut flows: Vec<Flow> = self.flows.iter().map(|e| e.value().clone()).collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flows)
    }

    async fn save(&self, run: &Run) -> Result<()> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let mut claimed = Vec::new();
        for id in self.candidates(|run| is_claimable(run, now)) {
            if claimed.len() >= limit {
                break;
            }
            if let Some(mut entry) = self.runs.get_mut(&id) {
                // Another caller may have claimed it since the scan.
                if is_claimable(&entry, now) {
                    entry.claim(claimant, now);
                    claimed.push(entry.clone());
                }
            }
        }

        if !claimed.is_empty() {
            debug!("Claimed {} due runs for {}", claimed.len(), claimant);
        }
        Ok(claimed)
    }

    async fn release(&self, id: Uuid, claimant: &str) -> Result<bool> {
        let mut entry = self.runs.get_mut(&id).ok_or(StorageError::RunNotFound(id))?;
        if entry.claimed_by.as_deref() != Some(claimant) {
            return Ok(false);
        }
        entry.release_claim();
        Ok(true)
    }

    async fn try_start(
        &self,
        id: Uuid,
        from: RunStatus,
        claimant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let Some(mut entry) = self.runs.get_mut(&id) else {
            return Ok(None);
        };
        if entry.status != from || entry.claimed_by.as_deref() != claimant {
            return Ok(None);
        }
        let started = match from {
            RunStatus::Pending => entry.start(now).is_ok(),
            RunStatus::InProgress => {
                entry.updated_at = now;
                true
            }
            _ => false,
        };
        Ok(started.then(|| entry.clone()))
    }

    async fn touch(&self, id: Uuid, claimant: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut entry) = self.runs.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != RunStatus::InProgress || entry.claimed_by.as_deref() != claimant {
            return Ok(false);
        }
        entry.updated_at = now;
        Ok(true)
    }

    async fn find_by_flow(&self, flow_name: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|entry| entry.flow_name == flow_name)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by_key(|run| (run.scheduled_at, run.created_at));
        Ok(runs)
    }

    async fn find_stalled(
        &self,
        stale_before: DateTime<Utc>,
        claimant: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let now = Utc::now();
        let mut claimed = Vec::new();
        for id in self.candidates(|run| is_stalled(run, stale_before)) {
            if claimed.len() >= limit {
                break;
            }
            if let Some(mut entry) = self.runs.get_mut(&id) {
                if is_stalled(&entry, stale_before) {
                    entry.reclaim_stalled(claimant, now);
                    claimed.push(entry.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn recover_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let mut recovered = 0u64;
        for mut entry in self.runs.iter_mut() {
            let stale = entry.status == RunStatus::Pending
                && entry.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                entry.release_claim();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0u64;
        self.runs.retain(|_id, run| {
            let expired = run.is_completed() && run.ended_at.is_some_and(|ended| ended < cutoff);
            if expired {
                deleted += 1;
            }
            !expired
        });
        Ok(deleted)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
