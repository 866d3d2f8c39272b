//! PostgreSQL implementation of the repository contracts.
//!
//! Production-ready persistence using:
//! - Optimistic CAS on `lock_owner` for instance and node leases
//! - `FOR UPDATE SKIP LOCKED` for queue claiming and stale-lease reclaim
//! - JSONB columns (via `sqlx::types::Json`) for the opaque spec/config/payload fields
//!
//! Table names: `meridian_workflow_definitions`, `meridian_workflow_instances`,
//! `meridian_task_nodes`, `meridian_schedules`, `meridian_schedule_executions`,
//! `meridian_queue_jobs`, `meridian_queue_groups`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::store::{
    DefinitionFilter, InstanceFilter, Pagination, QueueRepo, ScheduleExecutionRepo, ScheduleRepo,
    StoreError, TaskNodeRepo, WorkflowDefinitionRepo, WorkflowInstanceRepo,
};
use crate::error::CoreError;
use crate::reliability::{CircuitBreakerConfig, CircuitBreakerStore, CircuitState, CircuitStoreError, StoredBreakerState};
use crate::model::{
    DefinitionStatus, GroupStatus, InstanceStatus, JobStatus, NodeStatus, NodeType, QueueGroup,
    QueueJob, ScheduleDefinition, ScheduleExecution, ScheduleExecutionStatus, ScheduleTarget,
    TaskNode, WorkflowDefinition, WorkflowInstance, WorkflowSpec,
};

/// PostgreSQL-backed store. Clone is cheap: `PgPool` is an `Arc` internally.
///
/// # Example
///
/// ```ignore
/// use meridian_core::persistence::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/meridian").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn definition_status_str(status: DefinitionStatus) -> &'static str {
    match status {
        DefinitionStatus::Draft => "draft",
        DefinitionStatus::Active => "active",
        DefinitionStatus::Deprecated => "deprecated",
        DefinitionStatus::Archived => "archived",
    }
}

fn parse_definition_status(s: &str) -> DefinitionStatus {
    match s {
        "active" => DefinitionStatus::Active,
        "deprecated" => DefinitionStatus::Deprecated,
        "archived" => DefinitionStatus::Archived,
        _ => DefinitionStatus::Draft,
    }
}

fn instance_status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Pending => "pending",
        InstanceStatus::Running => "running",
        InstanceStatus::Paused => "paused",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Cancelled => "cancelled",
    }
}

fn parse_instance_status(s: &str) -> InstanceStatus {
    match s {
        "running" => InstanceStatus::Running,
        "paused" => InstanceStatus::Paused,
        "completed" => InstanceStatus::Completed,
        "failed" => InstanceStatus::Failed,
        "cancelled" => InstanceStatus::Cancelled,
        _ => InstanceStatus::Pending,
    }
}

fn node_status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Running => "running",
        NodeStatus::Completed => "completed",
        NodeStatus::Failed => "failed",
        NodeStatus::Skipped => "skipped",
        NodeStatus::Cancelled => "cancelled",
    }
}

fn parse_node_status(s: &str) -> NodeStatus {
    match s {
        "running" => NodeStatus::Running,
        "completed" => NodeStatus::Completed,
        "failed" => NodeStatus::Failed,
        "skipped" => NodeStatus::Skipped,
        "cancelled" => NodeStatus::Cancelled,
        _ => NodeStatus::Pending,
    }
}

fn node_type_str(t: NodeType) -> &'static str {
    match t {
        NodeType::Simple => "simple",
        NodeType::Parallel => "parallel",
        NodeType::Loop => "loop",
        NodeType::Branch => "branch",
    }
}

fn parse_node_type(s: &str) -> NodeType {
    match s {
        "parallel" => NodeType::Parallel,
        "loop" => NodeType::Loop,
        "branch" => NodeType::Branch,
        _ => NodeType::Simple,
    }
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Waiting => "waiting",
        JobStatus::Executing => "executing",
        JobStatus::Delayed => "delayed",
        JobStatus::Paused => "paused",
        JobStatus::Failed => "failed",
    }
}

fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "executing" => JobStatus::Executing,
        "delayed" => JobStatus::Delayed,
        "paused" => JobStatus::Paused,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Waiting,
    }
}

fn row_to_definition(row: &sqlx::postgres::PgRow) -> Result<WorkflowDefinition, StoreError> {
    let status: String = row.try_get("status")?;
    let tags: Vec<String> = row.try_get("tags")?;
    let Json(spec): Json<WorkflowSpec> = row.try_get("spec")?;
    Ok(WorkflowDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        status: parse_definition_status(&status),
        is_active: row.try_get("is_active")?,
        category: row.try_get("category")?,
        tags: tags.into_iter().collect(),
        spec,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl WorkflowDefinitionRepo for PostgresStore {
    #[instrument(skip(self, definition))]
    async fn create(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError> {
        let tags: Vec<String> = definition.tags.iter().cloned().collect();
        sqlx::query(
            r#"INSERT INTO meridian_workflow_definitions
               (id, name, version, display_name, description, status, is_active, category, tags, spec, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(definition.version)
        .bind(&definition.display_name)
        .bind(&definition.description)
        .bind(definition_status_str(definition.status))
        .bind(definition.is_active)
        .bind(&definition.category)
        .bind(&tags)
        .bind(Json(&definition.spec))
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(definition)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM meridian_workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_definition).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM meridian_workflow_definitions WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_definition).transpose()
    }

    #[instrument(skip(self))]
    async fn find_active_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM meridian_workflow_definitions WHERE name = $1 AND is_active = true",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_definition).transpose()
    }

    #[instrument(skip(self))]
    async fn activate(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let mut tx = self.pool.begin().await?;
        let name: String = sqlx::query_scalar("SELECT name FROM meridian_workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::DefinitionNotFound(id))?;

        sqlx::query(
            "UPDATE meridian_workflow_definitions SET is_active = false, status = 'deprecated', updated_at = now()
             WHERE name = $1 AND id != $2 AND is_active = true",
        )
        .bind(&name)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE meridian_workflow_definitions SET is_active = true, status = 'active', updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM meridian_workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        row_to_definition(&row)
    }

    #[instrument(skip(self, definition))]
    async fn update(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError> {
        let tags: Vec<String> = definition.tags.iter().cloned().collect();
        sqlx::query(
            r#"UPDATE meridian_workflow_definitions SET
               display_name = $2, description = $3, status = $4, is_active = $5,
               category = $6, tags = $7, updated_at = now()
               WHERE id = $1"#,
        )
        .bind(definition.id)
        .bind(&definition.display_name)
        .bind(&definition.description)
        .bind(definition_status_str(definition.status))
        .bind(definition.is_active)
        .bind(&definition.category)
        .bind(&tags)
        .execute(&self.pool)
        .await?;
        Ok(definition)
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        filter: DefinitionFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM meridian_workflow_definitions
               WHERE ($1::text IS NULL OR name = $1)
               AND ($2::text IS NULL OR category = $2)
               AND ($3::bool IS false OR is_active = true)
               ORDER BY name, version
               OFFSET $4 LIMIT $5"#,
        )
        .bind(&filter.name)
        .bind(&filter.category)
        .bind(filter.active_only)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_definition).collect()
    }
}

fn row_to_instance(row: &sqlx::postgres::PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.try_get("status")?;
    let completed_nodes: Vec<String> = row.try_get("completed_nodes")?;
    let failed_nodes: Vec<String> = row.try_get("failed_nodes")?;
    let Json(error): Json<Option<CoreError>> = row.try_get("error")?;
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        definition_id: row.try_get("definition_id")?,
        external_id: row.try_get("external_id")?,
        status: parse_instance_status(&status),
        input_data: row.try_get::<Json<serde_json::Value>, _>("input_data")?.0,
        context_data: row.try_get::<Json<serde_json::Value>, _>("context_data")?.0,
        output_data: row.try_get::<Json<serde_json::Value>, _>("output_data")?.0,
        business_key: row.try_get("business_key")?,
        mutex_key: row.try_get("mutex_key")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        priority: row.try_get("priority")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        paused_at: row.try_get("paused_at")?,
        error,
        current_node_id: row.try_get("current_node_id")?,
        completed_nodes: completed_nodes.into_iter().collect(),
        failed_nodes: failed_nodes.into_iter().collect(),
        lock_owner: row.try_get("lock_owner")?,
        lock_acquired_at: row.try_get("lock_acquired_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        assigned_engine_id: row.try_get("assigned_engine_id")?,
    })
}

#[async_trait]
impl WorkflowInstanceRepo for PostgresStore {
    #[instrument(skip(self, instance))]
    async fn create(&self, instance: WorkflowInstance) -> Result<WorkflowInstance, StoreError> {
        let completed: Vec<String> = instance.completed_nodes.iter().cloned().collect();
        let failed: Vec<String> = instance.failed_nodes.iter().cloned().collect();
        sqlx::query(
            r#"INSERT INTO meridian_workflow_instances
               (id, definition_id, external_id, status, input_data, context_data, output_data,
                business_key, mutex_key, retry_count, max_retries, priority, scheduled_at,
                started_at, completed_at, paused_at, error, current_node_id, completed_nodes,
                failed_nodes, lock_owner, lock_acquired_at, last_heartbeat, assigned_engine_id)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24)"#,
        )
        .bind(instance.id)
        .bind(instance.definition_id)
        .bind(&instance.external_id)
        .bind(instance_status_str(instance.status))
        .bind(Json(&instance.input_data))
        .bind(Json(&instance.context_data))
        .bind(Json(&instance.output_data))
        .bind(&instance.business_key)
        .bind(&instance.mutex_key)
        .bind(instance.retry_count as i32)
        .bind(instance.max_retries as i32)
        .bind(instance.priority)
        .bind(instance.scheduled_at)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(instance.paused_at)
        .bind(Json(&instance.error))
        .bind(&instance.current_node_id)
        .bind(&completed)
        .bind(&failed)
        .bind(&instance.lock_owner)
        .bind(instance.lock_acquired_at)
        .bind(instance.last_heartbeat)
        .bind(&instance.assigned_engine_id)
        .execute(&self.pool)
        .await?;
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM meridian_workflow_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM meridian_workflow_instances WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    #[instrument(skip(self, instance))]
    async fn update_status(
        &self,
        instance: WorkflowInstance,
        expected_lock_owner: Option<&str>,
    ) -> Result<WorkflowInstance, StoreError> {
        let completed: Vec<String> = instance.completed_nodes.iter().cloned().collect();
        let failed: Vec<String> = instance.failed_nodes.iter().cloned().collect();
        let result = sqlx::query(
            r#"UPDATE meridian_workflow_instances SET
               status = $2, output_data = $3, completed_at = $4, error = $5,
               current_node_id = $6, completed_nodes = $7, failed_nodes = $8,
               lock_owner = $9, lock_acquired_at = $10, last_heartbeat = $11,
               assigned_engine_id = $12, started_at = $13, paused_at = $14, context_data = $15
               WHERE id = $1 AND lock_owner IS NOT DISTINCT FROM $16"#,
        )
        .bind(instance.id)
        .bind(instance_status_str(instance.status))
        .bind(Json(&instance.output_data))
        .bind(instance.completed_at)
        .bind(Json(&instance.error))
        .bind(&instance.current_node_id)
        .bind(&completed)
        .bind(&failed)
        .bind(&instance.lock_owner)
        .bind(instance.lock_acquired_at)
        .bind(instance.last_heartbeat)
        .bind(&instance.assigned_engine_id)
        .bind(instance.started_at)
        .bind(instance.paused_at)
        .bind(Json(&instance.context_data))
        .bind(expected_lock_owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.find_by_id(instance.id).await?;
            return Err(StoreError::LeaseConflict {
                expected: expected_lock_owner.unwrap_or("<none>").to_string(),
                actual: current.and_then(|i| i.lock_owner),
            });
        }
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, id: Uuid, engine_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE meridian_workflow_instances SET last_heartbeat = $3 WHERE id = $1 AND lock_owner = $2",
        )
        .bind(id)
        .bind(engine_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseConflict { expected: engine_id.to_string(), actual: None });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_for_engine(
        &self,
        engine_id: &str,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let status = filter.status.map(instance_status_str);
        let rows = sqlx::query(
            r#"SELECT * FROM meridian_workflow_instances
               WHERE assigned_engine_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR mutex_key = $3)
               ORDER BY priority DESC, scheduled_at ASC
               OFFSET $4 LIMIT $5"#,
        )
        .bind(engine_id)
        .bind(status)
        .bind(&filter.mutex_key)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_instance).collect()
    }

    #[instrument(skip(self))]
    async fn list_reclaimable(&self, lease_ttl: Duration) -> Result<Vec<WorkflowInstance>, StoreError> {
        let ttl_secs = lease_ttl.as_secs() as f64;
        let rows = sqlx::query(
            r#"SELECT * FROM meridian_workflow_instances
               WHERE status = 'running'
               AND (last_heartbeat IS NULL OR last_heartbeat < now() - make_interval(secs => $1))
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(ttl_secs)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_instance).collect()
    }
}

fn row_to_node(row: &sqlx::postgres::PgRow) -> Result<TaskNode, StoreError> {
    let status: String = row.try_get("status")?;
    let node_type: String = row.try_get("node_type")?;
    let dependencies: Vec<String> = row.try_get("dependencies")?;
    let Json(retry_policy) = row.try_get::<Json<crate::reliability::RetryPolicy>, _>("retry_policy")?;
    let Json(error): Json<Option<CoreError>> = row.try_get("error")?;
    Ok(TaskNode {
        instance_id: row.try_get("instance_id")?,
        node_id: row.try_get("node_id")?,
        node_name: row.try_get("node_name")?,
        node_type: parse_node_type(&node_type),
        executor_name: row.try_get("executor_name")?,
        executor_config: row.try_get::<Json<serde_json::Value>, _>("executor_config")?.0,
        status: parse_node_status(&status),
        input_data: row.try_get::<Json<serde_json::Value>, _>("input_data")?.0,
        output_data: row.try_get::<Json<serde_json::Value>, _>("output_data")?.0,
        dependencies,
        parallel_group_id: row.try_get("parallel_group_id")?,
        parent_node_id: row.try_get("parent_node_id")?,
        branch_guard: row.try_get("branch_guard")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        retry_policy,
        error,
        assigned_engine_id: row.try_get("assigned_engine_id")?,
        lock_owner: row.try_get("lock_owner")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
    })
}

#[async_trait]
impl TaskNodeRepo for PostgresStore {
    #[instrument(skip(self, node))]
    async fn create(&self, node: TaskNode) -> Result<TaskNode, StoreError> {
        sqlx::query(
            r#"INSERT INTO meridian_task_nodes
               (instance_id, node_id, node_name, node_type, executor_name, executor_config,
                status, input_data, output_data, dependencies, parallel_group_id, parent_node_id,
                started_at, completed_at, duration_ms, retry_count, max_retries, retry_policy,
                error, assigned_engine_id, lock_owner, last_heartbeat, next_attempt_at, branch_guard)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24)"#,
        )
        .bind(node.instance_id)
        .bind(&node.node_id)
        .bind(&node.node_name)
        .bind(node_type_str(node.node_type))
        .bind(&node.executor_name)
        .bind(Json(&node.executor_config))
        .bind(node_status_str(node.status))
        .bind(Json(&node.input_data))
        .bind(Json(&node.output_data))
        .bind(&node.dependencies)
        .bind(&node.parallel_group_id)
        .bind(&node.parent_node_id)
        .bind(node.started_at)
        .bind(node.completed_at)
        .bind(node.duration_ms)
        .bind(node.retry_count as i32)
        .bind(node.max_retries as i32)
        .bind(Json(&node.retry_policy))
        .bind(Json(&node.error))
        .bind(&node.assigned_engine_id)
        .bind(&node.lock_owner)
        .bind(node.last_heartbeat)
        .bind(node.next_attempt_at)
        .bind(&node.branch_guard)
        .execute(&self.pool)
        .await?;
        Ok(node)
    }

    #[instrument(skip(self))]
    async fn find_by_node(&self, instance_id: Uuid, node_id: &str) -> Result<Option<TaskNode>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM meridian_task_nodes WHERE instance_id = $1 AND node_id = $2",
        )
        .bind(instance_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_node).transpose()
    }

    #[instrument(skip(self))]
    async fn find_all(&self, instance_id: Uuid) -> Result<Vec<TaskNode>, StoreError> {
        let rows = sqlx::query("SELECT * FROM meridian_task_nodes WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    /// A node is executable when pending, due (`next_attempt_at <= now`),
    /// and its `dependencies` array is contained in the instance's
    /// `completed_nodes` array — the same rule [`crate::dependency`]
    /// applies in memory, expressed as array containment.
    #[instrument(skip(self))]
    async fn find_executable(&self, instance_id: Uuid, limit: i64) -> Result<Vec<TaskNode>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT n.* FROM meridian_task_nodes n
               JOIN meridian_workflow_instances i ON i.id = n.instance_id
               WHERE n.instance_id = $1
               AND n.status = 'pending'
               AND (n.next_attempt_at IS NULL OR n.next_attempt_at <= now())
               AND n.dependencies <@ i.completed_nodes
               ORDER BY n.node_id
               LIMIT $2"#,
        )
        .bind(instance_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    #[instrument(skip(self, node))]
    async fn update_status(
        &self,
        node: TaskNode,
        expected_lock_owner: Option<&str>,
    ) -> Result<TaskNode, StoreError> {
        let result = sqlx::query(
            r#"UPDATE meridian_task_nodes SET
               status = $3, output_data = $4, completed_at = $5, duration_ms = $6,
               retry_count = $7, error = $8, lock_owner = $9, assigned_engine_id = $10,
               last_heartbeat = $11, started_at = $12, next_attempt_at = $13
               WHERE instance_id = $1 AND node_id = $2 AND lock_owner IS NOT DISTINCT FROM $14"#,
        )
        .bind(node.instance_id)
        .bind(&node.node_id)
        .bind(node_status_str(node.status))
        .bind(Json(&node.output_data))
        .bind(node.completed_at)
        .bind(node.duration_ms)
        .bind(node.retry_count as i32)
        .bind(Json(&node.error))
        .bind(&node.lock_owner)
        .bind(&node.assigned_engine_id)
        .bind(node.last_heartbeat)
        .bind(node.started_at)
        .bind(node.next_attempt_at)
        .bind(expected_lock_owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseConflict {
                expected: expected_lock_owner.unwrap_or("<none>").to_string(),
                actual: None,
            });
        }
        Ok(node)
    }

    #[instrument(skip(self))]
    async fn find_dependencies(&self, instance_id: Uuid, node_id: &str) -> Result<Vec<TaskNode>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT d.* FROM meridian_task_nodes d
               JOIN meridian_task_nodes n ON n.instance_id = d.instance_id AND d.node_id = ANY(n.dependencies)
               WHERE n.instance_id = $1 AND n.node_id = $2"#,
        )
        .bind(instance_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    #[instrument(skip(self))]
    async fn batch_update_status(
        &self,
        instance_id: Uuid,
        node_ids: &[String],
        status: NodeStatus,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE meridian_task_nodes SET status = $3 WHERE instance_id = $1 AND node_id = ANY($2)",
        )
        .bind(instance_id)
        .bind(node_ids)
        .bind(node_status_str(status))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_schedule(row: &sqlx::postgres::PgRow) -> Result<ScheduleDefinition, StoreError> {
    let tz_name: String = row.try_get("timezone")?;
    let timezone: chrono_tz::Tz = tz_name
        .parse()
        .map_err(|_| StoreError::Serialization(format!("unknown timezone '{tz_name}'")))?;
    let Json(target): Json<ScheduleTarget> = row.try_get("target")?;
    Ok(ScheduleDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        target,
        cron_expression: row.try_get("cron_expression")?,
        timezone,
        enabled: row.try_get("enabled")?,
        input_data: row.try_get::<Json<serde_json::Value>, _>("input_data")?.0,
        context_data: row.try_get::<Json<serde_json::Value>, _>("context_data")?.0,
        business_key: row.try_get("business_key")?,
        mutex_key: row.try_get("mutex_key")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
    })
}

#[async_trait]
impl ScheduleRepo for PostgresStore {
    #[instrument(skip(self, schedule))]
    async fn create(&self, schedule: ScheduleDefinition) -> Result<ScheduleDefinition, StoreError> {
        sqlx::query(
            r#"INSERT INTO meridian_schedules
               (id, name, target, cron_expression, timezone, enabled, input_data, context_data,
                business_key, mutex_key, next_run_at, last_run_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(Json(&schedule.target))
        .bind(&schedule.cron_expression)
        .bind(schedule.timezone.name())
        .bind(schedule.enabled)
        .bind(Json(&schedule.input_data))
        .bind(Json(&schedule.context_data))
        .bind(&schedule.business_key)
        .bind(&schedule.mutex_key)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .execute(&self.pool)
        .await?;
        Ok(schedule)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScheduleDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM meridian_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM meridian_schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    #[instrument(skip(self))]
    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>, StoreError> {
        let rows = sqlx::query("SELECT * FROM meridian_schedules WHERE enabled = true")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    #[instrument(skip(self, schedule))]
    async fn update(&self, schedule: ScheduleDefinition) -> Result<ScheduleDefinition, StoreError> {
        sqlx::query(
            r#"UPDATE meridian_schedules SET
               cron_expression = $2, timezone = $3, enabled = $4, next_run_at = $5, last_run_at = $6
               WHERE id = $1"#,
        )
        .bind(schedule.id)
        .bind(&schedule.cron_expression)
        .bind(schedule.timezone.name())
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .execute(&self.pool)
        .await?;
        Ok(schedule)
    }

    #[instrument(skip(self))]
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE meridian_schedules SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ScheduleExecution, StoreError> {
    let status: String = row.try_get("status")?;
    let Json(error): Json<Option<CoreError>> = row.try_get("error")?;
    Ok(ScheduleExecution {
        id: row.try_get("id")?,
        schedule_id: row.try_get("schedule_id")?,
        status: match status.as_str() {
            "success" => ScheduleExecutionStatus::Success,
            "failed" => ScheduleExecutionStatus::Failed,
            _ => ScheduleExecutionStatus::Running,
        },
        trigger_time: row.try_get("trigger_time")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        error,
    })
}

#[async_trait]
impl ScheduleExecutionRepo for PostgresStore {
    #[instrument(skip(self, execution))]
    async fn create(&self, execution: ScheduleExecution) -> Result<ScheduleExecution, StoreError> {
        sqlx::query(
            r#"INSERT INTO meridian_schedule_executions
               (id, schedule_id, status, trigger_time, started_at, completed_at, duration_ms, error)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
        )
        .bind(execution.id)
        .bind(execution.schedule_id)
        .bind(match execution.status {
            ScheduleExecutionStatus::Running => "running",
            ScheduleExecutionStatus::Success => "success",
            ScheduleExecutionStatus::Failed => "failed",
        })
        .bind(execution.trigger_time)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(Json(&execution.error))
        .execute(&self.pool)
        .await?;
        Ok(execution)
    }

    #[instrument(skip(self, execution))]
    async fn update(&self, execution: ScheduleExecution) -> Result<ScheduleExecution, StoreError> {
        sqlx::query(
            r#"UPDATE meridian_schedule_executions SET status = $2, completed_at = $3, duration_ms = $4, error = $5
               WHERE id = $1"#,
        )
        .bind(execution.id)
        .bind(match execution.status {
            ScheduleExecutionStatus::Running => "running",
            ScheduleExecutionStatus::Success => "success",
            ScheduleExecutionStatus::Failed => "failed",
        })
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(Json(&execution.error))
        .execute(&self.pool)
        .await?;
        Ok(execution)
    }

    #[instrument(skip(self))]
    async fn list_for_schedule(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM meridian_schedule_executions WHERE schedule_id = $1 ORDER BY started_at DESC OFFSET $2 LIMIT $3",
        )
        .bind(schedule_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn count_running_for_schedule(&self, schedule_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM meridian_schedule_executions WHERE schedule_id = $1 AND status = 'running'",
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<QueueJob, StoreError> {
    let status: String = row.try_get("status")?;
    let Json(error): Json<Option<CoreError>> = row.try_get("error")?;
    Ok(QueueJob {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        group_id: row.try_get("group_id")?,
        job_name: row.try_get("job_name")?,
        executor_name: row.try_get("executor_name")?,
        payload: row.try_get::<Json<serde_json::Value>, _>("payload")?.0,
        result: row.try_get::<Json<serde_json::Value>, _>("result")?.0,
        status: parse_job_status(&status),
        priority: row.try_get("priority")?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        delay_until: row.try_get("delay_until")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_until: row.try_get("locked_until")?,
        error,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        failed_at: row.try_get("failed_at")?,
    })
}

#[async_trait]
impl QueueRepo for PostgresStore {
    #[instrument(skip(self, job))]
    async fn enqueue(&self, job: QueueJob) -> Result<QueueJob, StoreError> {
        sqlx::query(
            r#"INSERT INTO meridian_queue_jobs
               (id, queue_name, group_id, job_name, executor_name, payload, result, status,
                priority, attempts, max_attempts, delay_until, created_at, updated_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)"#,
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.group_id)
        .bind(&job.job_name)
        .bind(&job.executor_name)
        .bind(Json(&job.payload))
        .bind(Json(&job.result))
        .bind(job_status_str(job.status))
        .bind(job.priority)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.delay_until)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        if let Some(group_id) = &job.group_id {
            sqlx::query(
                r#"INSERT INTO meridian_queue_groups (id, queue_name, group_id, status, total_jobs, completed_jobs, failed_jobs)
                   VALUES ($1, $2, $3, 'active', 1, 0, 0)
                   ON CONFLICT (queue_name, group_id) DO UPDATE SET total_jobs = meridian_queue_groups.total_jobs + 1"#,
            )
            .bind(Uuid::now_v7())
            .bind(&job.queue_name)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(job)
    }

    /// `SELECT ... FOR UPDATE SKIP LOCKED` lets many workers claim
    /// concurrently without blocking on each other's in-flight claims.
    #[instrument(skip(self))]
    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        n: i64,
        lock_timeout: Duration,
    ) -> Result<Vec<QueueJob>, StoreError> {
        let lock_secs = lock_timeout.as_secs() as f64;
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"SELECT * FROM meridian_queue_jobs
               WHERE queue_name = $1
               AND (status = 'waiting' OR (status = 'delayed' AND delay_until <= now()))
               ORDER BY priority DESC, created_at ASC
               LIMIT $2
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(queue_name)
        .bind(n)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            sqlx::query(
                r#"UPDATE meridian_queue_jobs SET
                   status = 'executing', locked_by = $2, locked_at = now(),
                   locked_until = now() + make_interval(secs => $3),
                   started_at = COALESCE(started_at, now()), attempts = attempts + 1, updated_at = now()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(worker_id)
            .bind(lock_secs)
            .execute(&mut *tx)
            .await?;
            claimed.push(row_to_job(row)?);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    #[instrument(skip(self, result))]
    async fn ack(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM meridian_queue_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        let job = row_to_job(&row)?;

        sqlx::query(
            r#"INSERT INTO meridian_queue_success
               (id, queue_name, group_id, job_name, executor_name, payload, result, attempts, created_at, completed_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,now())"#,
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.group_id)
        .bind(&job.job_name)
        .bind(&job.executor_name)
        .bind(Json(&job.payload))
        .bind(Json(&result))
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM meridian_queue_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if let Some(group_id) = &job.group_id {
            sqlx::query(
                "UPDATE meridian_queue_groups SET completed_jobs = completed_jobs + 1 WHERE queue_name = $1 AND group_id = $2",
            )
            .bind(&job.queue_name)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn nack(&self, id: Uuid, error: CoreError, retryable: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM meridian_queue_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        let job = row_to_job(&row)?;

        if retryable && job.attempts < job.max_attempts {
            let delay_secs = 2f64.powi(job.attempts.min(10) as i32);
            sqlx::query(
                r#"UPDATE meridian_queue_jobs SET
                   status = 'delayed', delay_until = now() + make_interval(secs => $2),
                   locked_by = NULL, locked_until = NULL, error = $3, updated_at = now()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(delay_secs)
            .bind(Json(&error))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"INSERT INTO meridian_queue_failures
                   (id, queue_name, group_id, job_name, executor_name, payload, attempts, error, created_at, failed_at)
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,now())"#,
            )
            .bind(job.id)
            .bind(&job.queue_name)
            .bind(&job.group_id)
            .bind(&job.job_name)
            .bind(&job.executor_name)
            .bind(Json(&job.payload))
            .bind(job.attempts as i32)
            .bind(Json(&error))
            .bind(job.created_at)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM meridian_queue_jobs WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if let Some(group_id) = &job.group_id {
                sqlx::query(
                    "UPDATE meridian_queue_groups SET failed_jobs = failed_jobs + 1 WHERE queue_name = $1 AND group_id = $2",
                )
                .bind(&job.queue_name)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, id: Uuid, worker_id: &str, extension: Duration) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE meridian_queue_jobs SET locked_until = now() + make_interval(secs => $3)
               WHERE id = $1 AND locked_by = $2"#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(extension.as_secs() as f64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseConflict { expected: worker_id.to_string(), actual: None });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sweep(&self, queue_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE meridian_queue_jobs SET status = 'waiting', locked_by = NULL, locked_until = NULL, attempts = attempts + 1
               WHERE queue_name = $1 AND status = 'executing' AND locked_until < now()"#,
        )
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn depth(&self, queue_name: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM meridian_queue_jobs WHERE queue_name = $1 AND status = 'waiting'",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn find_group(&self, queue_name: &str, group_id: &str) -> Result<Option<QueueGroup>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM meridian_queue_groups WHERE queue_name = $1 AND group_id = $2",
        )
        .bind(queue_name)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let status: String = r.try_get("status")?;
            Ok(QueueGroup {
                id: r.try_get("id")?,
                queue_name: r.try_get("queue_name")?,
                group_id: r.try_get("group_id")?,
                status: if status == "paused" { GroupStatus::Paused } else { GroupStatus::Active },
                total_jobs: r.try_get::<i64, _>("total_jobs")? as u64,
                completed_jobs: r.try_get::<i64, _>("completed_jobs")? as u64,
                failed_jobs: r.try_get::<i64, _>("failed_jobs")? as u64,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl CircuitBreakerStore for PostgresStore {
    #[instrument(skip(self))]
    async fn get_circuit_breaker(&self, key: &str) -> Result<Option<StoredBreakerState>, CircuitStoreError> {
        let row = sqlx::query(
            "SELECT state, failure_count, success_count, opened_at FROM meridian_circuit_breaker_state WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CircuitStoreError(e.to_string()))?;

        row.map(|r| {
            let state: String = r.try_get("state").map_err(|e| CircuitStoreError(e.to_string()))?;
            Ok(StoredBreakerState {
                state: match state.as_str() {
                    "open" => CircuitState::Open,
                    "half_open" => CircuitState::HalfOpen,
                    _ => CircuitState::Closed,
                },
                failure_count: r.try_get::<i32, _>("failure_count").map_err(|e| CircuitStoreError(e.to_string()))? as u32,
                success_count: r.try_get::<i32, _>("success_count").map_err(|e| CircuitStoreError(e.to_string()))? as u32,
                opened_at: r.try_get("opened_at").map_err(|e| CircuitStoreError(e.to_string()))?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, _config))]
    async fn create_circuit_breaker(&self, key: &str, _config: &CircuitBreakerConfig) -> Result<(), CircuitStoreError> {
        sqlx::query(
            r#"INSERT INTO meridian_circuit_breaker_state (key, state, failure_count, success_count, opened_at)
               VALUES ($1, 'closed', 0, 0, NULL)
               ON CONFLICT (key) DO NOTHING"#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| CircuitStoreError(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_circuit_breaker(
        &self,
        key: &str,
        state: CircuitState,
        failure_count: u32,
        success_count: u32,
    ) -> Result<(), CircuitStoreError> {
        let state_str = match state {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        sqlx::query(
            r#"INSERT INTO meridian_circuit_breaker_state (key, state, failure_count, success_count, opened_at)
               VALUES ($1, $2, $3, $4, CASE WHEN $2 = 'open' THEN now() ELSE NULL END)
               ON CONFLICT (key) DO UPDATE SET
                 state = $2, failure_count = $3, success_count = $4,
                 opened_at = CASE WHEN $2 = 'open' THEN now() ELSE NULL END"#,
        )
        .bind(key)
        .bind(state_str)
        .bind(failure_count as i32)
        .bind(success_count as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| CircuitStoreError(e.to_string()))?;
        Ok(())
    }
}
