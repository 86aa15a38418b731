//! Processing units and the registry that resolves them.
//!
//! A processing unit does the actual data movement for a flow. It receives a
//! [`RunContext`] for progress reporting and, when the run is a resumption,
//! the cursor saved by the previous attempt. It reports failure by returning
//! a [`Failure`] value; panics are caught by the executor and converted into
//! one.

use crate::core::{capture_backtrace, Flow, ProgressUpdate, Run};
use crate::storage::{RunRepository, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Boxed error accepted from unit factories and unit internals.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a processing unit: a kind tag plus a detail map.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    pub details: BTreeMap<String, Value>,
    /// Best-effort; present only when backtraces are enabled.
    pub backtrace: Option<String>,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: BTreeMap::new(),
            backtrace: capture_backtrace(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "processing unit panicked".to_string()
        };
        Self {
            kind: "panic".to_string(),
            message,
            details: BTreeMap::new(),
            backtrace: None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        Failure::new("io", e.to_string()).with_detail("io_kind", format!("{:?}", e.kind()))
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::new("serialization", e.to_string())
            .with_detail("line", e.line())
            .with_detail("column", e.column())
    }
}

impl From<StorageError> for Failure {
    fn from(e: StorageError) -> Self {
        Failure::new("dependency", e.to_string())
    }
}

impl From<BoxError> for Failure {
    fn from(e: BoxError) -> Self {
        Failure::new("error", e.to_string())
    }
}

/// The unit of work behind a flow.
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    /// Process one run.
    ///
    /// `cursor` is `None` on a fresh run and the last cursor reported through
    /// [`RunContext::update_progress`] on a resumed one.
    async fn process(&self, ctx: RunContext, cursor: Option<Value>) -> Result<(), Failure>;
}

/// Builds a processing unit for a flow.
pub type UnitFactory =
    Arc<dyn Fn(&Flow) -> Result<Arc<dyn ProcessingUnit>, BoxError> + Send + Sync>;

/// Maps a flow's `processor` identifier to a unit factory.
///
/// # Example
///
/// ```
/// use sluice::executor::{Failure, ProcessingUnit, Registry, RunContext};
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// struct Noop;
///
/// #[async_trait]
/// impl ProcessingUnit for Noop {
///     async fn process(&self, _ctx: RunContext, _cursor: Option<Value>) -> Result<(), Failure> {
///         Ok(())
///     }
/// }
///
/// let mut registry = Registry::new();
/// registry.register_unit("noop", Arc::new(Noop));
/// assert!(registry.contains("noop"));
/// ```
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<String, UnitFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory called once per execution with the owning flow.
    pub fn register<F>(&mut self, processor: impl Into<String>, factory: F)
    where
        F: Fn(&Flow) -> Result<Arc<dyn ProcessingUnit>, BoxError> + Send + Sync + 'static,
    {
        self.factories.insert(processor.into(), Arc::new(factory));
    }

    /// Registers one shared unit instance for every flow naming `processor`.
    pub fn register_unit(&mut self, processor: impl Into<String>, unit: Arc<dyn ProcessingUnit>) {
        self.register(processor, move |_flow: &Flow| Ok(unit.clone()));
    }

    pub fn contains(&self, processor: &str) -> bool {
        self.factories.contains_key(processor)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Resolves the unit for `flow`.
    ///
    /// Fails with kind `unknown_processor` when nothing is registered under
    /// the flow's processor and `processor_init` when the factory errors.
    pub fn resolve(&self, flow: &Flow) -> Result<Arc<dyn ProcessingUnit>, Failure> {
        let factory = self.factories.get(&flow.processor).ok_or_else(|| {
            Failure::new(
                "unknown_processor",
                format!("no processing unit registered as '{}'", flow.processor),
            )
            .with_detail("flow", flow.name.clone())
        })?;

        factory(flow).map_err(|e| {
            Failure::new("processor_init", e.to_string()).with_detail("flow", flow.name.clone())
        })
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut processors: Vec<_> = self.factories.keys().collect();
        processors.sort();
        f.debug_struct("Registry")
            .field("processors", &processors)
            .finish()
    }
}

/// Handle given to a processing unit for the duration of one run.
///
/// Progress reported through it is merged into the run and persisted before
/// the call returns, so a crash right after an update still resumes from it.
#[derive(Clone)]
pub struct RunContext {
    run_id: Uuid,
    flow: Arc<Flow>,
    run: Arc<Mutex<Run>>,
    repo: Arc<dyn RunRepository>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: Uuid,
        flow: Arc<Flow>,
        run: Arc<Mutex<Run>>,
        repo: Arc<dyn RunRepository>,
    ) -> Self {
        Self {
            run_id,
            flow,
            run,
            repo,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// A copy of the run as it currently stands.
    pub async fn snapshot(&self) -> Run {
        self.run.lock().await.clone()
    }

    /// Merges `update` into the run and persists it.
    pub async fn update_progress(&self, update: ProgressUpdate) -> Result<(), StorageError> {
        let mut run = self.run.lock().await;
        run.update_progress(update, Utc::now());
        self.repo.save(&run).await
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("flow", &self.flow.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRunRepository;

    struct Noop;

    #[async_trait]
    impl ProcessingUnit for Noop {
        async fn process(&self, _ctx: RunContext, _cursor: Option<Value>) -> Result<(), Failure> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let mut registry = Registry::new();
        registry.register_unit("noop", Arc::new(Noop));

        assert!(registry.resolve(&Flow::new("orders", "noop")).is_ok());

        let err = registry.resolve(&Flow::new("orders", "missing")).err().unwrap();
        assert_eq!(err.kind, "unknown_processor");
        assert_eq!(err.details["flow"], "orders");
    }

    #[test]
    fn test_factory_receives_flow_and_errors_are_tagged() {
        let mut registry = Registry::new();
        registry.register("strict", |flow: &Flow| {
            if flow.source_config.is_null() {
                Err("source_config is required".into())
            } else {
                Ok(Arc::new(Noop) as Arc<dyn ProcessingUnit>)
            }
        });

        let err = registry.resolve(&Flow::new("orders", "strict")).err().unwrap();
        assert_eq!(err.kind, "processor_init");
        assert!(err.message.contains("source_config"));

        let configured =
            Flow::new("orders", "strict").with_source_config(serde_json::json!({"table": "t"}));
        assert!(registry.resolve(&configured).is_ok());
    }

    #[test]
    fn test_failure_conversions() {
        let io = Failure::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(io.kind, "io");
        assert_eq!(io.details["io_kind"], "TimedOut");

        let json = Failure::from(serde_json::from_str::<Value>("{").unwrap_err());
        assert_eq!(json.kind, "serialization");

        let panic = Failure::from_panic(Box::new("kaboom"));
        assert_eq!(panic.kind, "panic");
        assert_eq!(panic.message, "kaboom");
        assert_eq!(panic.to_string(), "panic: kaboom");
    }

    #[tokio::test]
    async fn test_context_progress_is_persisted_immediately() {
        let repo = Arc::new(InMemoryRunRepository::new());
        let mut run = Run::new("orders", Utc::now());
        run.start(Utc::now()).unwrap();
        repo.save(&run).await.unwrap();

        let ctx = RunContext::new(
            run.id(),
            Arc::new(Flow::new("orders", "noop")),
            Arc::new(Mutex::new(run.clone())),
            repo.clone(),
        );
        assert_eq!(ctx.run_id(), run.id());

        ctx.update_progress(ProgressUpdate::new().cursor(10).records(10))
            .await
            .unwrap();

        let stored = repo.get(run.id()).await.unwrap().unwrap();
        assert_eq!(stored.progress().current_cursor(), Some(&Value::from(10)));
        assert_eq!(ctx.snapshot().await.records_processed(), Some(10));
    }
}
