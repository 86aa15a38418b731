use super::error::{CoreError, Result};
use super::run::RunStatus;
use super::schedule::{next_cron_run, next_interval_run, validate_cron};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Inactive,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Active => "active",
            FlowStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for FlowStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(FlowStatus::Active),
            "inactive" => Ok(FlowStatus::Inactive),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// When and how a flow runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Fixed spacing between runs, measured from the previous run.
    #[serde(default, with = "interval_secs")]
    pub interval: Option<Duration>,
    /// Cron expression (5 or 6 fields). Takes precedence over `interval`.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Flows sharing a group share one exclusion key.
    #[serde(default)]
    pub concurrency_group: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interval: None,
            cron: None,
            enabled: true,
            concurrency_group: None,
        }
    }
}

impl RuntimeConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            cron: Some(expr.into()),
            ..Self::default()
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

mod interval_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// A named, configured recurring pipeline.
///
/// Flows are owned by the host application. The orchestrator reads them and
/// records `last_run_at`/`last_run_status`, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    /// Registry identifier of the processing unit that runs this flow.
    pub processor: String,
    #[serde(default)]
    pub source_config: Value,
    #[serde(default)]
    pub sink_config: Value,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    pub status: FlowStatus,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: Option<RunStatus>,
}

impl Flow {
    pub fn new(name: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processor: processor.into(),
            source_config: Value::Null,
            sink_config: Value::Null,
            runtime_config: RuntimeConfig::default(),
            status: FlowStatus::Active,
            last_run_at: None,
            last_run_status: None,
        }
    }

    pub fn with_runtime_config(mut self, runtime_config: RuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    pub fn with_source_config(mut self, config: Value) -> Self {
        self.source_config = config;
        self
    }

    pub fn with_sink_config(mut self, config: Value) -> Self {
        self.sink_config = config;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }

    pub fn is_schedulable(&self) -> bool {
        self.is_active() && self.runtime_config.enabled
    }

    /// Key under which runs of this flow are mutually excluded.
    pub fn concurrency_key(&self) -> String {
        match &self.runtime_config.concurrency_group {
            Some(group) => format!("group:{}", group),
            None => format!("flow:{}", self.name),
        }
    }

    /// When the next run of this flow should become due, if it recurs at all.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        if let Some(expr) = &self.runtime_config.cron {
            return next_cron_run(expr, now).map(Some);
        }
        match self.runtime_config.interval {
            Some(interval) => next_interval_run(interval, self.last_run_at, now).map(Some),
            None => Ok(None),
        }
    }

    /// Checks the runtime config without computing a schedule.
    pub fn validate(&self) -> Result<()> {
        if let Some(expr) = &self.runtime_config.cron {
            validate_cron(expr)?;
        }
        if self.runtime_config.interval == Some(Duration::ZERO) {
            return Err(CoreError::InvalidSchedule(format!(
                "flow '{}' has a zero interval",
                self.name
            )));
        }
        Ok(())
    }

    /// Records the terminal outcome of one of this flow's runs.
    pub fn record_outcome(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.last_run_at = Some(at);
        self.last_run_status = Some(status);
    }
}
