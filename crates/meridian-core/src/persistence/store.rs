//! Repository contracts (§6). The core never throws across this boundary:
//! every operation returns `Result<T, StoreError>`, and the storage layer
//! owns all SQL/graph traversal behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    NodeStatus, QueueGroup, QueueJob, ScheduleDefinition, ScheduleExecution, TaskNode,
    WorkflowDefinition, WorkflowInstance,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("task node not found: instance={0} node={1}")]
    NodeNotFound(Uuid, String),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),
    #[error("queue job not found: {0}")]
    JobNotFound(Uuid),
    #[error("lease conflict: expected owner '{expected}', actual '{actual:?}'")]
    LeaseConflict { expected: String, actual: Option<String> },
    #[error("concurrency conflict: expected sequence {expected}, actual {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: 100 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    pub name: Option<String>,
    pub category: Option<String>,
    pub active_only: bool,
}

/// CRUD plus the atomic-activation lifecycle for workflow definitions.
#[async_trait]
pub trait WorkflowDefinitionRepo: Send + Sync {
    async fn create(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError>;
    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;
    async fn find_active_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>, StoreError>;
    /// Activates `id`, atomically deactivating any prior active sibling with
    /// the same `name` in the same transaction.
    async fn activate(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError>;
    async fn update(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError>;
    async fn list(
        &self,
        filter: DefinitionFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<crate::model::InstanceStatus>,
    pub mutex_key: Option<String>,
    pub assigned_engine_id: Option<String>,
}

/// Lifecycle, lease, and heartbeat operations for workflow instances.
#[async_trait]
pub trait WorkflowInstanceRepo: Send + Sync {
    async fn create(&self, instance: WorkflowInstance) -> Result<WorkflowInstance, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<WorkflowInstance>, StoreError>;
    /// CAS write guarded by `expected_lock_owner`; fails with
    /// `StoreError::LeaseConflict` if the current owner differs.
    async fn update_status(
        &self,
        instance: WorkflowInstance,
        expected_lock_owner: Option<&str>,
    ) -> Result<WorkflowInstance, StoreError>;
    async fn heartbeat(&self, id: Uuid, engine_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
    async fn list_for_engine(
        &self,
        engine_id: &str,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;
    /// Instances whose lease has expired, available for any engine to reclaim.
    async fn list_reclaimable(&self, lease_ttl: std::time::Duration) -> Result<Vec<WorkflowInstance>, StoreError>;
}

/// Node persistence, including the bounded executable scan the dispatcher polls.
#[async_trait]
pub trait TaskNodeRepo: Send + Sync {
    async fn create(&self, node: TaskNode) -> Result<TaskNode, StoreError>;
    async fn find_by_node(&self, instance_id: Uuid, node_id: &str) -> Result<Option<TaskNode>, StoreError>;
    async fn find_all(&self, instance_id: Uuid) -> Result<Vec<TaskNode>, StoreError>;
    async fn find_executable(&self, instance_id: Uuid, limit: i64) -> Result<Vec<TaskNode>, StoreError>;
    async fn update_status(
        &self,
        node: TaskNode,
        expected_lock_owner: Option<&str>,
    ) -> Result<TaskNode, StoreError>;
    async fn find_dependencies(&self, instance_id: Uuid, node_id: &str) -> Result<Vec<TaskNode>, StoreError>;
    async fn batch_update_status(
        &self,
        instance_id: Uuid,
        node_ids: &[String],
        status: NodeStatus,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ScheduleRepo: Send + Sync {
    async fn create(&self, schedule: ScheduleDefinition) -> Result<ScheduleDefinition, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScheduleDefinition>, StoreError>;
    async fn find_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>, StoreError>;
    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>, StoreError>;
    async fn update(&self, schedule: ScheduleDefinition) -> Result<ScheduleDefinition, StoreError>;
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ScheduleExecutionRepo: Send + Sync {
    async fn create(&self, execution: ScheduleExecution) -> Result<ScheduleExecution, StoreError>;
    async fn update(&self, execution: ScheduleExecution) -> Result<ScheduleExecution, StoreError>;
    async fn list_for_schedule(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecution>, StoreError>;
    async fn count_running_for_schedule(&self, schedule_id: Uuid) -> Result<i64, StoreError>;
}

/// Durable queue operations (C8). All writes below are single transactions.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    async fn enqueue(&self, job: QueueJob) -> Result<QueueJob, StoreError>;
    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        n: i64,
        lock_timeout: std::time::Duration,
    ) -> Result<Vec<QueueJob>, StoreError>;
    async fn ack(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError>;
    async fn nack(&self, id: Uuid, error: crate::error::CoreError, retryable: bool) -> Result<(), StoreError>;
    async fn heartbeat(&self, id: Uuid, worker_id: &str, extension: std::time::Duration) -> Result<(), StoreError>;
    /// Reclaims executing jobs whose lease expired; returns how many were reclaimed.
    async fn sweep(&self, queue_name: &str) -> Result<u64, StoreError>;
    async fn depth(&self, queue_name: &str) -> Result<i64, StoreError>;
    async fn find_group(&self, queue_name: &str, group_id: &str) -> Result<Option<QueueGroup>, StoreError>;
}
