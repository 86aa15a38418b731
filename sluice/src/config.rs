//! Runtime configuration for the scheduler, executor, concurrency controller
//! and ingestion listener.
//!
//! Every struct has a `Default` matching production-sane values and `with_*`
//! builder methods for the knobs a deployment usually changes.

use crate::core::{DEFAULT_BACKTRACE_FRAMES, OVERDUE_THRESHOLD};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Sweep and background-ticker settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity written into `claimed_by`. Must be unique per scheduler process.
    pub claimant_id: String,
    /// Maximum runs claimed per sweep.
    pub batch_size: usize,
    /// Runs executed concurrently within one sweep. `1` means sequential.
    pub max_parallel: usize,
    pub overdue_threshold: Duration,
    /// A pending run claimed longer ago than this is assumed orphaned.
    pub stale_claim_after: Duration,
    /// A resumable in-progress run untouched for this long is resumed.
    pub stalled_run_after: Duration,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claimant_id: format!("sluice-{}", Uuid::new_v4()),
            batch_size: 100,
            max_parallel: 1,
            overdue_threshold: OVERDUE_THRESHOLD,
            stale_claim_after: Duration::from_secs(5 * 60),
            stalled_run_after: Duration::from_secs(15 * 60),
            tick_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_claimant_id(mut self, claimant_id: impl Into<String>) -> Self {
        self.claimant_id = claimant_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_overdue_threshold(mut self, threshold: Duration) -> Self {
        self.overdue_threshold = threshold;
        self
    }

    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after = after;
        self
    }

    pub fn with_stalled_run_after(mut self, after: Duration) -> Self {
        self.stalled_run_after = after;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Frames kept in `error_backtrace` on a failed run.
    pub backtrace_frames: usize,
    /// How often a running unit's run gets its `updated_at` refreshed.
    ///
    /// Must stay well below [`SchedulerConfig::stalled_run_after`], or a
    /// quiet but healthy run is picked up as stalled by another sweep.
    pub heartbeat_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backtrace_frames: DEFAULT_BACKTRACE_FRAMES,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl ExecutorConfig {
    pub fn with_backtrace_frames(mut self, frames: usize) -> Self {
        self.backtrace_frames = frames;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }
}

/// Per-key dispatch limits.
///
/// Keys are [`crate::core::Flow::concurrency_key`] values. A group limit is
/// looked up by group name, without the `group:` prefix.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub default_limit: usize,
    pub group_limits: HashMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: 1,
            group_limits: HashMap::new(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn with_group_limit(mut self, group: impl Into<String>, limit: usize) -> Self {
        self.group_limits.insert(group.into(), limit.max(1));
        self
    }

    /// Limit for a concurrency key.
    pub fn limit_for(&self, key: &str) -> usize {
        key.strip_prefix("group:")
            .and_then(|group| self.group_limits.get(group).copied())
            .unwrap_or(self.default_limit)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// How long `start` waits for the accept loop to report readiness.
    pub start_timeout: Duration,
    /// How long `stop` waits for the accept loop to exit before aborting it.
    pub stop_grace: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            start_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl ListenerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}
