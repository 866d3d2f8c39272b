//! Engine dispatcher (C6): the tick loop that turns ready nodes into
//! executor calls.
//!
//! Mirrors the shape of the teacher's worker pool: a `watch`-channel
//! shutdown signal, a semaphore bounding in-flight work, and a handful of
//! `tokio::select!`-driven background loops. Unlike a worker pool pulling
//! from one durable queue, the dispatcher owns two lease-bearing
//! entities at once (the instance and each of its nodes), so a tick walks
//! every instance this engine currently owns rather than polling a single
//! claim endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::context::{ContextBuilder, ContextMode};
use crate::dependency::{DependencyResolver, Readiness};
use crate::error::CoreError;
use crate::executor::{ExecutorContext, ExecutorRegistry, InstanceView, NodeView, RegistryError};
use crate::model::{InstanceStatus, NodeStatus, NodeType, TaskNode, WorkflowInstance};
use crate::persistence::{InstanceFilter, Pagination, StoreError, TaskNodeRepo, WorkflowInstanceRepo};
use crate::reliability::{TimeoutManager, TimeoutType};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine_id: String,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub tick_idle: Duration,
    pub tick_busy: Duration,
    pub node_scan_limit: i64,
    pub max_concurrency: usize,
    pub default_node_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: format!("engine-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            tick_idle: Duration::from_millis(500),
            tick_busy: Duration::from_millis(50),
            node_scan_limit: 100,
            max_concurrency: 10,
            default_node_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("engine already running")]
    AlreadyRunning,
    #[error("shutdown timed out with nodes still in flight")]
    ShutdownTimeout,
}

/// Drives ready nodes through execution for every instance this engine
/// holds the lease on. `S` must implement both repo traits the dispatcher
/// needs; [`crate::persistence::InMemoryStore`] and
/// [`crate::persistence::PostgresStore`] both qualify.
pub struct EngineDispatcher<S> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<EngineStatus>,
    active_nodes: Arc<Semaphore>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S> EngineDispatcher<S>
where
    S: WorkflowInstanceRepo + TaskNodeRepo + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, registry: Arc<ExecutorRegistry>, config: EngineConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            active_nodes: Arc::new(Semaphore::new(config.max_concurrency)),
            store,
            registry,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(EngineStatus::Stopped),
            loop_handle: std::sync::Mutex::new(None),
            config,
        })
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    pub fn engine_id(&self) -> &str {
        &self.config.engine_id
    }

    #[instrument(skip(self), fields(engine_id = %self.config.engine_id))]
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut status = self.status.write();
            if *status == EngineStatus::Running {
                return Err(EngineError::AlreadyRunning);
            }
            *status = EngineStatus::Running;
        }
        info!(max_concurrency = self.config.max_concurrency, "starting engine dispatcher");
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move { dispatcher.run().await });
        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    #[instrument(skip(self), fields(engine_id = %self.config.engine_id))]
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        {
            let mut status = self.status.write();
            if *status == EngineStatus::Stopped {
                return Ok(());
            }
            *status = EngineStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.active_nodes.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown timed out waiting for in-flight nodes");
                return Err(EngineError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        *self.status.write() = EngineStatus::Stopped;
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut interval = self.config.tick_idle;
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            match self.tick().await {
                Ok(did_work) => {
                    interval = if did_work { self.config.tick_busy } else { self.config.tick_idle };
                }
                Err(e) => {
                    error!(error = %e, "engine tick failed");
                    interval = self.config.tick_idle;
                }
            }
        }
        debug!("engine dispatcher loop exiting");
    }

    /// One scan-and-dispatch pass. Returns whether any node was dispatched
    /// or any terminal transition was applied, which drives the adaptive
    /// poll interval.
    async fn tick(&self) -> Result<bool, EngineError> {
        let now = Utc::now();
        let mut did_work = false;

        for mut instance in self.store.list_reclaimable(self.config.lease_ttl).await? {
            if instance.try_acquire_lease(&self.config.engine_id, self.config.lease_ttl, now).is_ok() {
                info!(instance_id = %instance.id, "reclaimed expired lease");
                let _ = self.store.update_status(instance, None).await;
            }
        }

        let owned = self
            .store
            .list_for_engine(
                &self.config.engine_id,
                InstanceFilter { status: Some(InstanceStatus::Running), ..Default::default() },
                Pagination { offset: 0, limit: self.config.node_scan_limit },
            )
            .await?;

        for instance in owned {
            if self.store.heartbeat(instance.id, &self.config.engine_id, now).await.is_err() {
                warn!(instance_id = %instance.id, "lost lease before heartbeat, skipping this tick");
                continue;
            }
            match self.process_instance(instance).await {
                Ok(instance_did_work) => did_work |= instance_did_work,
                Err(e) => error!(error = %e, "failed processing instance"),
            }
        }

        Ok(did_work)
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn process_instance(&self, mut instance: WorkflowInstance) -> Result<bool, EngineError> {
        let nodes = self.store.find_all(instance.id).await?;
        let completed: HashSet<String> = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.node_id.clone())
            .collect();

        let now = Utc::now();
        let ready = DependencyResolver::ready_nodes(&nodes, &completed, now, |n| branch_guard_value(n, &instance));

        let mut did_work = false;
        let mut dispatched = FuturesUnordered::new();

        for readiness in ready {
            match readiness {
                Readiness::Skip(node) => {
                    let mut node = node.clone();
                    node.skip().ok();
                    self.store.update_status(node, None).await?;
                    did_work = true;
                }
                Readiness::Ready(node) => {
                    let Ok(permit) = Arc::clone(&self.active_nodes).try_acquire_owned() else {
                        break;
                    };
                    let mut node = node.clone();
                    if node.start(&self.config.engine_id, now).is_err() {
                        continue;
                    }
                    let node = match self.store.update_status(node, None).await {
                        Ok(n) => n,
                        Err(_) => continue,
                    };
                    did_work = true;
                    let fut = self.dispatch_node(node, instance.clone(), nodes.clone(), permit);
                    dispatched.push(fut);
                }
            }
        }

        let mut newly_completed = Vec::new();
        let mut newly_failed = Vec::new();
        while let Some(node) = dispatched.next().await {
            let node_id = node.node_id.clone();
            match node.status {
                NodeStatus::Completed => newly_completed.push(node_id),
                NodeStatus::Failed => newly_failed.push((node_id, node.error.clone())),
                _ => {}
            }
        }

        if !newly_completed.is_empty() || !newly_failed.is_empty() {
            for id in &newly_completed {
                instance.record_node_completed(id.clone());
            }
            for (id, _) in &newly_failed {
                instance.record_node_failed(id.clone());
            }

            if let Some((_, Some(err))) = newly_failed.into_iter().find(|(_, e)| e.is_some()) {
                instance.fail(err);
            } else {
                let refreshed = self.store.find_all(instance.id).await?;
                let all_terminal = refreshed.iter().all(|n| {
                    matches!(n.status, NodeStatus::Completed | NodeStatus::Skipped | NodeStatus::Cancelled)
                });
                if all_terminal {
                    instance.complete(Value::Null);
                }
            }
            self.store.update_status(instance, Some(&self.config.engine_id)).await?;
        }

        Ok(did_work)
    }

    async fn dispatch_node(
        &self,
        mut node: TaskNode,
        instance: WorkflowInstance,
        all_nodes: Vec<TaskNode>,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) -> TaskNode {
        let context = ContextBuilder::build(&instance, &node, &all_nodes, ContextMode::DirectPredecessors);
        let executor = match self.registry.get(&node.executor_name) {
            Ok(e) => e,
            Err(e) => {
                let _ = node.fail(CoreError::fatal(format!("executor lookup failed: {e}")));
                let node = self.persist_terminal(node).await;
                return node;
            }
        };

        let cancel = CancellationToken::new();
        let ctx = ExecutorContext {
            instance: InstanceView {
                instance_id: instance.id,
                business_key: instance.business_key.clone(),
                mutex_key: instance.mutex_key.clone(),
            },
            node: NodeView {
                node_id: node.node_id.clone(),
                attempt: node.retry_count + 1,
                max_attempts: node.max_retries + 1,
            },
            config: {
                let mut merged = context.as_object().cloned().unwrap_or_default();
                merged.insert("executorConfig".into(), node.executor_config.clone());
                Value::Object(merged)
            },
            cancel: cancel.clone(),
            progress: None,
        };

        let outcome = tokio::time::timeout(self.config.default_node_timeout, executor.execute(&ctx)).await;
        match outcome {
            Ok(outcome) if outcome.success => {
                let _ = node.complete(outcome.data.unwrap_or(Value::Null));
            }
            Ok(outcome) => {
                let message = outcome.error.unwrap_or_else(|| "executor reported failure".to_string());
                let _ = node.fail(CoreError::executor_failure(message));
            }
            Err(_) => {
                cancel.cancel();
                let _ = node.fail(CoreError::timeout(TimeoutManager::message_for(TimeoutType::StartToClose)));
            }
        }
        self.persist_terminal(node).await
    }

    async fn persist_terminal(&self, node: TaskNode) -> TaskNode {
        match self.store.update_status(node.clone(), Some(&self.config.engine_id)).await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, node_id = %node.node_id, "failed to persist node terminal state");
                node
            }
        }
    }
}

/// Evaluates a branch node's guard against the instance's context data.
/// Returns `None` for non-branch nodes (always dispatched when ready).
fn branch_guard_value(node: &TaskNode, instance: &WorkflowInstance) -> Option<bool> {
    if node.node_type != NodeType::Branch {
        return None;
    }
    let key = node.branch_guard.as_deref()?;
    let value = instance.context_data.get(key)?;
    Some(is_truthy(value))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutionOutcome, ValidationResult};
    use crate::model::definition::{NodeSpec, NodeType as SpecNodeType};
    use crate::persistence::InMemoryStore;
    use crate::reliability::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        fn name(&self) -> &str {
            "echo"
        }
        fn validate(&self, _config: &Value) -> ValidationResult {
            ValidationResult::ok()
        }
        async fn execute(&self, ctx: &ExecutorContext) -> ExecutionOutcome {
            ExecutionOutcome::success(ctx.config.clone())
        }
    }

    fn node_spec(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            node_id: id.into(),
            node_name: id.into(),
            node_type: SpecNodeType::Simple,
            executor_name: "echo".into(),
            executor_config: json!({}),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            parallel_group_id: None,
            branch_guard: None,
            retry_policy: RetryPolicy::no_retry(),
            timeout: Default::default(),
        }
    }

    #[tokio::test]
    async fn dispatches_ready_node_and_completes_linear_chain() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));
        let registry = Arc::new(registry);

        let definition_id = Uuid::now_v7();
        let mut instance = WorkflowInstance::new(definition_id, json!({"x": 1}));
        instance.try_acquire_lease("engine-test", Duration::from_secs(60), Utc::now()).unwrap();
        let instance = store.create(instance).await.unwrap();

        let node_a = TaskNode::new(instance.id, &node_spec("A", &[]));
        let node_b = TaskNode::new(instance.id, &node_spec("B", &["A"]));
        store.create(node_a).await.unwrap();
        store.create(node_b).await.unwrap();

        let config = EngineConfig {
            engine_id: "engine-test".into(),
            max_concurrency: 4,
            ..Default::default()
        };
        let dispatcher = EngineDispatcher::new(store.clone(), registry, config);

        // First tick dispatches and completes A.
        dispatcher.tick().await.unwrap();
        let a = store.find_by_node(instance.id, "A").await.unwrap().unwrap();
        assert_eq!(a.status, NodeStatus::Completed);

        // Second tick dispatches and completes B, which finalizes the instance.
        dispatcher.tick().await.unwrap();
        let b = store.find_by_node(instance.id, "B").await.unwrap().unwrap();
        assert_eq!(b.status, NodeStatus::Completed);
        let refreshed = store.find_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, InstanceStatus::Completed);
    }
}
