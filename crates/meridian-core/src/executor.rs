//! Executor registry (C1): name/version lookup, validation, execution.
//!
//! An executor is a named, pluggable unit of work invoked by both the engine
//! dispatcher (for task nodes) and the job processor (for queue jobs).
//! Registration is process-scope; lookups that fail to resolve are fatal and
//! non-retryable for the caller's node or job.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result of [`Executor::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { valid: true, errors: vec![] }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self { valid: false, errors }
    }
}

/// Outcome of [`Executor::execute`]. Mirrors the `{success, data?, error?}`
/// shape at the plug-in boundary; `success = false` is a node failure
/// subject to retry, distinct from the executor throwing/erroring.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()) }
    }
}

/// Health of an executor as reported by its optional health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Read-only view of the owning instance, handed to an executor at call time.
#[derive(Debug, Clone)]
pub struct InstanceView {
    pub instance_id: uuid::Uuid,
    pub business_key: Option<String>,
    pub mutex_key: Option<String>,
}

/// Read-only view of the node being executed.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub node_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Progress callback handed to executors that want to report partial progress.
pub type ProgressFn = Arc<dyn Fn(u8, Option<String>) + Send + Sync>;

/// Everything an executor needs to run: views of the instance/node, merged
/// config, a cancellation signal, and a way to report progress.
pub struct ExecutorContext {
    pub instance: InstanceView,
    pub node: NodeView,
    pub config: Value,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
}

impl ExecutorContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report_progress(&self, percent: u8, message: Option<String>) {
        if let Some(cb) = &self.progress {
            cb(percent, message);
        }
    }
}

/// A named, versioned unit of work. Implementors register themselves in an
/// [`ExecutorRegistry`]; the engine and job processor never depend on a
/// concrete implementation.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Semantic version this implementation satisfies. Lookups pin to a
    /// specific version only when the caller asks for one.
    fn version(&self) -> &str {
        "1.0.0"
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let _ = config;
        ValidationResult::ok()
    }

    async fn execute(&self, ctx: &ExecutorContext) -> ExecutionOutcome;

    async fn health_check(&self) -> ExecutorHealth {
        ExecutorHealth::Unknown
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no executor registered for '{0}'")]
    Unknown(String),
    #[error("executor '{name}' version '{registered}' does not satisfy requested '{requested}'")]
    VersionMismatch {
        name: String,
        registered: String,
        requested: String,
    },
}

/// Process-scope map from executor name to implementation.
///
/// Lookup by name only returns the registered executor unconditionally;
/// lookup with a requested version rejects a non-matching registered
/// version rather than silently substituting.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self { executors: HashMap::new() }
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>, RegistryError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    pub fn get_versioned(
        &self,
        name: &str,
        requested_version: &str,
    ) -> Result<Arc<dyn Executor>, RegistryError> {
        let executor = self.get(name)?;
        if executor.version() != requested_version {
            return Err(RegistryError::VersionMismatch {
                name: name.to_string(),
                registered: executor.version().to_string(),
                requested: requested_version.to_string(),
            });
        }
        Ok(executor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn executor_names(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executor_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: &ExecutorContext) -> ExecutionOutcome {
            ExecutionOutcome::success(ctx.config.clone())
        }
    }

    #[tokio::test]
    async fn registers_and_looks_up_by_name() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_err());
    }

    #[tokio::test]
    async fn versioned_lookup_rejects_mismatch() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));
        assert!(registry.get_versioned("echo", "1.0.0").is_ok());
        assert!(registry.get_versioned("echo", "2.0.0").is_err());
    }

    #[tokio::test]
    async fn execute_runs_the_registered_implementation() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));
        let executor = registry.get("echo").unwrap();
        let ctx = ExecutorContext {
            instance: InstanceView { instance_id: uuid::Uuid::now_v7(), business_key: None, mutex_key: None },
            node: NodeView { node_id: "A".into(), attempt: 1, max_attempts: 1 },
            config: serde_json::json!({"x": 1}),
            cancel: CancellationToken::new(),
            progress: None,
        };
        let outcome = executor.execute(&ctx).await;
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(serde_json::json!({"x": 1})));
    }
}
