//! Per-key dispatch exclusion and dispatch planning.
//!
//! Every flow maps to a concurrency key (`flow:<name>`, or `group:<name>` for
//! flows sharing a group). A [`DispatchPermit`] holds one slot of a key for
//! as long as it lives; dropping it frees the slot and wakes waiters.
//!
//! This guards executions within one process. Across processes, the executor
//! additionally checks the repository for an in-progress run of the same flow.

use crate::config::ConcurrencyConfig;
use crate::core::{Flow, Run};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Slots {
    held: DashMap<String, usize>,
    released: Notify,
}

/// Hands out per-key dispatch permits.
#[derive(Clone)]
pub struct ConcurrencyController {
    config: Arc<ConcurrencyConfig>,
    slots: Arc<Slots>,
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config: Arc::new(config),
            slots: Arc::new(Slots::default()),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Takes a slot of `key` if one is free.
    pub fn try_acquire(&self, key: &str) -> Option<DispatchPermit> {
        let limit = self.config.limit_for(key);
        let mut held = self.slots.held.entry(key.to_string()).or_insert(0);
        if *held >= limit {
            debug!("Concurrency key {} is saturated ({}/{})", key, *held, limit);
            return None;
        }
        *held += 1;
        Some(DispatchPermit {
            key: key.to_string(),
            slots: self.slots.clone(),
        })
    }

    /// Waits until a slot of `key` is free and takes it.
    pub async fn acquire(&self, key: &str) -> DispatchPermit {
        loop {
            // Register interest before checking, so a release in between is not missed.
            let released = self.slots.released.notified();
            if let Some(permit) = self.try_acquire(key) {
                return permit;
            }
            released.await;
        }
    }

    /// Permits currently held for `key`.
    pub fn outstanding(&self, key: &str) -> usize {
        self.slots.held.get(key).map(|held| *held).unwrap_or(0)
    }

    /// Assigns a start time to each flow, in input order.
    ///
    /// `Bulk` starts everything at `now`. `Staggered(interval)` starts the
    /// i-th flow at `now + i * interval`, spreading load on shared sources.
    pub fn plan_dispatch(
        &self,
        flows: &[Flow],
        mode: DispatchMode,
        now: DateTime<Utc>,
    ) -> Vec<DispatchTicket> {
        flows
            .iter()
            .enumerate()
            .map(|(i, flow)| DispatchTicket {
                flow: flow.name.clone(),
                run_at: mode.offset(i, now),
                job_id: Uuid::new_v4(),
            })
            .collect()
    }
}

/// How a batch of flows is spread over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Bulk,
    Staggered(Duration),
}

impl DispatchMode {
    fn offset(&self, index: usize, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DispatchMode::Bulk => now,
            DispatchMode::Staggered(interval) => u32::try_from(index)
                .ok()
                .and_then(|i| interval.checked_mul(i))
                .and_then(|offset| chrono::Duration::from_std(offset).ok())
                .and_then(|offset| now.checked_add_signed(offset))
                .unwrap_or(now),
        }
    }
}

/// One planned dispatch: which flow, when, and the id its run will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTicket {
    pub flow: String,
    pub run_at: DateTime<Utc>,
    pub job_id: Uuid,
}

impl DispatchTicket {
    /// The pending run this ticket stands for. Its id is the ticket's `job_id`.
    pub fn to_run(&self) -> Run {
        let mut run = Run::new(self.flow.clone(), self.run_at);
        run.id = self.job_id;
        run
    }
}

/// RAII guard over one slot of a concurrency key.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct DispatchPermit {
    key: String,
    slots: Arc<Slots>,
}

impl DispatchPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for DispatchPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPermit").field("key", &self.key).finish()
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        if let Some(mut held) = self.slots.held.get_mut(&self.key) {
            *held = held.saturating_sub(1);
        }
        self.slots.held.remove_if(&self.key, |_, held| *held == 0);
        self.slots.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RuntimeConfig;

    #[test]
    fn test_exclusive_by_default() {
        let controller = ConcurrencyController::default();
        let permit = controller.try_acquire("flow:orders").unwrap();
        assert_eq!(permit.key(), "flow:orders");
        assert_eq!(controller.outstanding("flow:orders"), 1);
        assert!(controller.try_acquire("flow:orders").is_none());

        // Other keys are independent.
        assert!(controller.try_acquire("flow:invoices").is_some());

        drop(permit);
        assert_eq!(controller.outstanding("flow:orders"), 0);
        assert!(controller.try_acquire("flow:orders").is_some());
    }

    #[test]
    fn test_group_limit() {
        let controller =
            ConcurrencyController::new(ConcurrencyConfig::default().with_group_limit("warehouse", 2));
        let a = controller.try_acquire("group:warehouse").unwrap();
        let _b = controller.try_acquire("group:warehouse").unwrap();
        assert!(controller.try_acquire("group:warehouse").is_none());
        drop(a);
        assert!(controller.try_acquire("group:warehouse").is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let controller = ConcurrencyController::default();
        let held = controller.try_acquire("flow:orders").unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire("flow:orders").await.key().to_string() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        let key = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "flow:orders");
    }

    #[test]
    fn test_staggered_plan() {
        let controller = ConcurrencyController::default();
        let flows = vec![
            Flow::new("a", "copy"),
            Flow::new("b", "copy"),
            Flow::new("c", "copy"),
        ];
        let now = Utc::now();

        let tickets =
            controller.plan_dispatch(&flows, DispatchMode::Staggered(Duration::from_secs(10)), now);
        let offsets: Vec<_> = tickets.iter().map(|t| (t.run_at - now).num_seconds()).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
        let names: Vec<_> = tickets.iter().map(|t| t.flow.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let bulk = controller.plan_dispatch(&flows, DispatchMode::Bulk, now);
        assert!(bulk.iter().all(|t| t.run_at == now));
    }

    #[test]
    fn test_ticket_run_carries_job_id() {
        let flow = Flow::new("a", "copy")
            .with_runtime_config(RuntimeConfig::every(Duration::from_secs(60)));
        let ticket = ConcurrencyController::default()
            .plan_dispatch(&[flow], DispatchMode::Bulk, Utc::now())
            .remove(0);
        let run = ticket.to_run();
        assert_eq!(run.id(), ticket.job_id);
        assert_eq!(run.scheduled_at(), ticket.run_at);
        assert!(run.is_pending());
    }
}
