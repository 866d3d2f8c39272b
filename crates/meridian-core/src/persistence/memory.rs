//! In-memory implementation of every repository trait, used for unit tests
//! and local development without a database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{
    InstanceStatus, NodeStatus, QueueGroup, QueueJob, ScheduleDefinition, ScheduleExecution,
    TaskNode, WorkflowDefinition, WorkflowInstance,
};
use crate::reliability::{CircuitBreakerConfig, CircuitBreakerStore, CircuitState, CircuitStoreError, StoredBreakerState};

use super::store::{
    DefinitionFilter, InstanceFilter, Pagination, QueueRepo, ScheduleExecutionRepo, ScheduleRepo,
    StoreError, TaskNodeRepo, WorkflowDefinitionRepo, WorkflowInstanceRepo,
};

/// A single in-process store backing all repository traits with
/// `parking_lot::RwLock<HashMap<..>>`. Restart loses everything; that is the
/// point — callers rebuild from a real store on restart.
#[derive(Default)]
pub struct InMemoryStore {
    definitions: RwLock<HashMap<(String, i32), WorkflowDefinition>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    nodes: RwLock<HashMap<(Uuid, String), TaskNode>>,
    schedules: RwLock<HashMap<Uuid, ScheduleDefinition>>,
    schedule_executions: RwLock<HashMap<Uuid, ScheduleExecution>>,
    jobs: RwLock<HashMap<Uuid, QueueJob>>,
    groups: RwLock<HashMap<(String, String), QueueGroup>>,
    circuit_breakers: RwLock<HashMap<String, StoredBreakerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    pub fn job_count(&self, queue_name: &str) -> usize {
        self.jobs.read().values().filter(|j| j.queue_name == queue_name).count()
    }

    pub fn clear(&self) {
        self.definitions.write().clear();
        self.instances.write().clear();
        self.nodes.write().clear();
        self.schedules.write().clear();
        self.schedule_executions.write().clear();
        self.jobs.write().clear();
        self.groups.write().clear();
        self.circuit_breakers.write().clear();
    }
}

#[async_trait]
impl CircuitBreakerStore for InMemoryStore {
    async fn get_circuit_breaker(&self, key: &str) -> Result<Option<StoredBreakerState>, CircuitStoreError> {
        Ok(self.circuit_breakers.read().get(key).cloned())
    }

    async fn create_circuit_breaker(&self, key: &str, _config: &CircuitBreakerConfig) -> Result<(), CircuitStoreError> {
        self.circuit_breakers.write().insert(
            key.to_string(),
            StoredBreakerState { state: CircuitState::Closed, failure_count: 0, success_count: 0, opened_at: None },
        );
        Ok(())
    }

    async fn update_circuit_breaker(
        &self,
        key: &str,
        state: CircuitState,
        failure_count: u32,
        success_count: u32,
    ) -> Result<(), CircuitStoreError> {
        let opened_at = if state == CircuitState::Open { Some(Utc::now()) } else { None };
        self.circuit_breakers
            .write()
            .insert(key.to_string(), StoredBreakerState { state, failure_count, success_count, opened_at });
        Ok(())
    }
}

#[async_trait]
impl WorkflowDefinitionRepo for InMemoryStore {
    async fn create(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError> {
        let key = (definition.name.clone(), definition.version);
        self.definitions.write().insert(key, definition.clone());
        Ok(definition)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.read().values().find(|d| d.id == id).cloned())
    }

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.read().get(&(name.to_string(), version)).cloned())
    }

    async fn find_active_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .values()
            .find(|d| d.name == name && d.is_active)
            .cloned())
    }

    async fn activate(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let mut definitions = self.definitions.write();
        let name = definitions
            .values()
            .find(|d| d.id == id)
            .map(|d| d.name.clone())
            .ok_or(StoreError::DefinitionNotFound(id))?;
        for d in definitions.values_mut() {
            if d.name == name && d.id != id {
                d.deprecate();
            }
        }
        let target = definitions
            .values_mut()
            .find(|d| d.id == id)
            .ok_or(StoreError::DefinitionNotFound(id))?;
        target.activate();
        Ok(target.clone())
    }

    async fn update(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError> {
        let key = (definition.name.clone(), definition.version);
        self.definitions.write().insert(key, definition.clone());
        Ok(definition)
    }

    async fn list(
        &self,
        filter: DefinitionFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut out: Vec<WorkflowDefinition> = self
            .definitions
            .read()
            .values()
            .filter(|d| filter.name.as_ref().map(|n| n == &d.name).unwrap_or(true))
            .filter(|d| filter.category.as_ref().map(|c| Some(c) == d.category.as_ref()).unwrap_or(true))
            .filter(|d| !filter.active_only || d.is_active)
            .cloned()
            .collect();
        out.sort_by_key(|d| (d.name.clone(), d.version));
        Ok(out
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl WorkflowInstanceRepo for InMemoryStore {
    async fn create(&self, instance: WorkflowInstance) -> Result<WorkflowInstance, StoreError> {
        self.instances.write().insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.instances.read().get(&id).cloned())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .find(|i| i.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn update_status(
        &self,
        instance: WorkflowInstance,
        expected_lock_owner: Option<&str>,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut instances = self.instances.write();
        let current = instances
            .get(&instance.id)
            .ok_or(StoreError::InstanceNotFound(instance.id))?;
        if current.lock_owner.as_deref() != expected_lock_owner {
            return Err(StoreError::LeaseConflict {
                expected: expected_lock_owner.unwrap_or("<none>").to_string(),
                actual: current.lock_owner.clone(),
            });
        }
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn heartbeat(&self, id: Uuid, engine_id: &str, now: chrono::DateTime<Utc>) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances.get_mut(&id).ok_or(StoreError::InstanceNotFound(id))?;
        let current_owner = instance.lock_owner.clone();
        instance
            .heartbeat(engine_id, now)
            .map_err(|_| StoreError::LeaseConflict { expected: engine_id.to_string(), actual: current_owner })?;
        Ok(())
    }

    async fn list_for_engine(
        &self,
        engine_id: &str,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut out: Vec<WorkflowInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| i.assigned_engine_id.as_deref() == Some(engine_id))
            .filter(|i| filter.status.map(|s| s == i.status).unwrap_or(true))
            .filter(|i| filter.mutex_key.as_ref().map(|k| Some(k) == i.mutex_key.as_ref()).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|i| std::cmp::Reverse(i.priority));
        Ok(out
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    async fn list_reclaimable(&self, lease_ttl: Duration) -> Result<Vec<WorkflowInstance>, StoreError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::zero());
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| {
                i.status == InstanceStatus::Running
                    && i.last_heartbeat.map(|hb| now - hb > ttl).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskNodeRepo for InMemoryStore {
    async fn create(&self, node: TaskNode) -> Result<TaskNode, StoreError> {
        let key = (node.instance_id, node.node_id.clone());
        self.nodes.write().insert(key, node.clone());
        Ok(node)
    }

    async fn find_by_node(&self, instance_id: Uuid, node_id: &str) -> Result<Option<TaskNode>, StoreError> {
        Ok(self.nodes.read().get(&(instance_id, node_id.to_string())).cloned())
    }

    async fn find_all(&self, instance_id: Uuid) -> Result<Vec<TaskNode>, StoreError> {
        Ok(self
            .nodes
            .read()
            .values()
            .filter(|n| n.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn find_executable(&self, instance_id: Uuid, limit: i64) -> Result<Vec<TaskNode>, StoreError> {
        let nodes = self.find_all(instance_id).await?;
        let instance = self
            .instances
            .read()
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        let now = Utc::now();
        let mut ready: Vec<TaskNode> = crate::dependency::DependencyResolver::ready_nodes(
            &nodes,
            &instance.completed_nodes,
            now,
            |_| None,
        )
        .into_iter()
        .filter_map(|r| match r {
            crate::dependency::Readiness::Ready(n) => Some(n.clone()),
            crate::dependency::Readiness::Skip(_) => None,
        })
        .collect();
        ready.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        ready.truncate(limit.max(0) as usize);
        Ok(ready)
    }

    async fn update_status(
        &self,
        node: TaskNode,
        expected_lock_owner: Option<&str>,
    ) -> Result<TaskNode, StoreError> {
        let key = (node.instance_id, node.node_id.clone());
        let mut nodes = self.nodes.write();
        if let Some(current) = nodes.get(&key) {
            if current.lock_owner.as_deref() != expected_lock_owner
                && current.status == NodeStatus::Running
            {
                return Err(StoreError::LeaseConflict {
                    expected: expected_lock_owner.unwrap_or("<none>").to_string(),
                    actual: current.lock_owner.clone(),
                });
            }
        }
        nodes.insert(key, node.clone());
        Ok(node)
    }

    async fn find_dependencies(&self, instance_id: Uuid, node_id: &str) -> Result<Vec<TaskNode>, StoreError> {
        let node = self
            .find_by_node(instance_id, node_id)
            .await?
            .ok_or_else(|| StoreError::NodeNotFound(instance_id, node_id.to_string()))?;
        let all = self.find_all(instance_id).await?;
        Ok(all
            .into_iter()
            .filter(|n| node.dependencies.contains(&n.node_id))
            .collect())
    }

    async fn batch_update_status(
        &self,
        instance_id: Uuid,
        node_ids: &[String],
        status: NodeStatus,
    ) -> Result<u64, StoreError> {
        let mut nodes = self.nodes.write();
        let mut count = 0;
        for node_id in node_ids {
            if let Some(node) = nodes.get_mut(&(instance_id, node_id.clone())) {
                node.status = status;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ScheduleRepo for InMemoryStore {
    async fn create(&self, schedule: ScheduleDefinition) -> Result<ScheduleDefinition, StoreError> {
        self.schedules.write().insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScheduleDefinition>, StoreError> {
        Ok(self.schedules.read().get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>, StoreError> {
        Ok(self.schedules.read().values().find(|s| s.name == name).cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>, StoreError> {
        Ok(self.schedules.read().values().filter(|s| s.enabled).cloned().collect())
    }

    async fn update(&self, schedule: ScheduleDefinition) -> Result<ScheduleDefinition, StoreError> {
        self.schedules.write().insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules.get_mut(&id).ok_or(StoreError::ScheduleNotFound(id))?;
        schedule.enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl ScheduleExecutionRepo for InMemoryStore {
    async fn create(&self, execution: ScheduleExecution) -> Result<ScheduleExecution, StoreError> {
        self.schedule_executions.write().insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update(&self, execution: ScheduleExecution) -> Result<ScheduleExecution, StoreError> {
        self.schedule_executions.write().insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn list_for_schedule(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleExecution>, StoreError> {
        let mut out: Vec<ScheduleExecution> = self
            .schedule_executions
            .read()
            .values()
            .filter(|e| e.schedule_id == schedule_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| std::cmp::Reverse(e.started_at));
        Ok(out
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    async fn count_running_for_schedule(&self, schedule_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .schedule_executions
            .read()
            .values()
            .filter(|e| e.schedule_id == schedule_id)
            .filter(|e| e.status == crate::model::ScheduleExecutionStatus::Running)
            .count() as i64)
    }
}

#[async_trait]
impl QueueRepo for InMemoryStore {
    async fn enqueue(&self, mut job: QueueJob) -> Result<QueueJob, StoreError> {
        if let Some(delay_until) = job.delay_until {
            if delay_until > Utc::now() {
                job.status = crate::model::JobStatus::Delayed;
            }
        }
        if let Some(group_id) = job.group_id.clone() {
            let mut groups = self.groups.write();
            let group = groups
                .entry((job.queue_name.clone(), group_id.clone()))
                .or_insert_with(|| QueueGroup::new(job.queue_name.clone(), group_id));
            group.total_jobs += 1;
        }
        self.jobs.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        n: i64,
        lock_timeout: Duration,
    ) -> Result<Vec<QueueJob>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let mut candidates: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.queue_name == queue_name && j.is_claimable(now))
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| {
            let j = &jobs[id];
            (std::cmp::Reverse(j.priority), j.created_at)
        });
        candidates.truncate(n.max(0) as usize);

        let mut claimed = Vec::new();
        for id in candidates {
            let job = jobs.get_mut(&id).unwrap();
            job.status = crate::model::JobStatus::Executing;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.locked_until = Some(now + chrono::Duration::from_std(lock_timeout).unwrap_or(chrono::Duration::seconds(30)));
            job.started_at.get_or_insert(now);
            job.attempts += 1;
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn ack(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.result = result;
        job.updated_at = Utc::now();
        let queue_name = job.queue_name.clone();
        let group_id = job.group_id.clone();
        jobs.remove(&id);
        if let Some(group_id) = group_id {
            if let Some(group) = self.groups.write().get_mut(&(queue_name, group_id)) {
                group.completed_jobs += 1;
            }
        }
        Ok(())
    }

    async fn nack(&self, id: Uuid, error: crate::error::CoreError, retryable: bool) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        let now = Utc::now();
        if retryable && job.attempts < job.max_attempts {
            let delay = Duration::from_secs(2u64.saturating_pow(job.attempts.min(10)));
            job.status = crate::model::JobStatus::Delayed;
            job.delay_until = Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
            job.locked_by = None;
            job.locked_until = None;
            job.error = Some(error);
            job.updated_at = now;
        } else {
            job.status = crate::model::JobStatus::Failed;
            job.failed_at = Some(now);
            job.error = Some(error);
            job.updated_at = now;
            let queue_name = job.queue_name.clone();
            let group_id = job.group_id.clone();
            jobs.remove(&id);
            if let Some(group_id) = group_id {
                if let Some(group) = self.groups.write().get_mut(&(queue_name, group_id)) {
                    group.failed_jobs += 1;
                }
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, extension: Duration) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseConflict {
                expected: worker_id.to_string(),
                actual: job.locked_by.clone(),
            });
        }
        job.locked_until = Some(Utc::now() + chrono::Duration::from_std(extension).unwrap_or(chrono::Duration::zero()));
        Ok(())
    }

    async fn sweep(&self, queue_name: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let mut reclaimed = 0;
        for job in jobs.values_mut() {
            if job.queue_name != queue_name {
                continue;
            }
            if job.status == crate::model::JobStatus::Executing
                && job.locked_until.map(|t| t < now).unwrap_or(false)
            {
                job.status = crate::model::JobStatus::Waiting;
                job.locked_by = None;
                job.locked_until = None;
                job.attempts += 1;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn depth(&self, queue_name: &str) -> Result<i64, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|j| j.queue_name == queue_name && j.status == crate::model::JobStatus::Waiting)
            .count() as i64)
    }

    async fn find_group(&self, queue_name: &str, group_id: &str) -> Result<Option<QueueGroup>, StoreError> {
        Ok(self
            .groups
            .read()
            .get(&(queue_name.to_string(), group_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScheduleTarget, WorkflowInstance};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn activate_deactivates_prior_sibling() {
        let store = InMemoryStore::new();
        let spec = crate::model::WorkflowSpec::default();
        let v1 = store.create(WorkflowDefinition::new("greet", 1, spec.clone())).await.unwrap();
        let v2 = store.create(WorkflowDefinition::new("greet", 2, spec)).await.unwrap();

        store.activate(v1.id).await.unwrap();
        store.activate(v2.id).await.unwrap();

        let v1_after = store.find_by_name_and_version("greet", 1).await.unwrap().unwrap();
        let v2_after = store.find_by_name_and_version("greet", 2).await.unwrap().unwrap();
        assert!(!v1_after.is_active);
        assert!(v2_after.is_active);
    }

    #[tokio::test]
    async fn instance_update_status_rejects_wrong_lock_owner() {
        let store = InMemoryStore::new();
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), Value::Null);
        instance.try_acquire_lease("e1", Duration::from_secs(60), Utc::now()).unwrap();
        let instance = store.create(instance).await.unwrap();

        let mut completed = instance.clone();
        completed.complete(Value::Null);
        let result = WorkflowInstanceRepo::update_status(&store, completed, Some("e2")).await;
        assert!(matches!(result, Err(StoreError::LeaseConflict { .. })));
    }

    #[tokio::test]
    async fn claim_then_ack_moves_job_out_of_live_set() {
        let store = InMemoryStore::new();
        let job = QueueJob::new("default", "send-email", "email", json!({}));
        store.enqueue(job).await.unwrap();

        let claimed = store.claim("default", "w1", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        store.ack(claimed[0].id, json!({"ok": true})).await.unwrap();
        assert_eq!(store.job_count("default"), 0);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_lease() {
        let store = InMemoryStore::new();
        let job = QueueJob::new("default", "job", "noop", json!({}));
        store.enqueue(job).await.unwrap();
        let claimed = store
            .claim("default", "w1", 1, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.sweep("default").await.unwrap();
        assert_eq!(reclaimed, 1);
    }

    #[tokio::test]
    async fn cron_schedule_roundtrips() {
        let store = InMemoryStore::new();
        let schedule = ScheduleDefinition::new(
            "nightly",
            ScheduleTarget::Executor { executor_name: "cleanup".into() },
            "0 2 * * *",
            chrono_tz::UTC,
        )
        .unwrap();
        store.create(schedule.clone()).await.unwrap();
        let found = store.find_by_name("nightly").await.unwrap().unwrap();
        assert_eq!(found.id, schedule.id);
    }
}
