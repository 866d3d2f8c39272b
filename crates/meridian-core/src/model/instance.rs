//! `WorkflowInstance` — one execution of a [`super::WorkflowDefinition`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

/// One execution of a definition.
///
/// `lock_owner` is non-null iff `status = Running` and `last_heartbeat` is
/// within the lease TTL; the repository enforces this as a single CAS write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub external_id: Option<String>,
    pub status: InstanceStatus,
    pub input_data: Value,
    pub context_data: Value,
    pub output_data: Value,
    pub business_key: Option<String>,
    pub mutex_key: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub error: Option<CoreError>,
    pub current_node_id: Option<String>,
    pub completed_nodes: HashSet<String>,
    pub failed_nodes: HashSet<String>,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub assigned_engine_id: Option<String>,
}

impl WorkflowInstance {
    pub fn new(definition_id: Uuid, input_data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id,
            external_id: None,
            status: InstanceStatus::Pending,
            input_data,
            context_data: Value::Object(serde_json::Map::new()),
            output_data: Value::Null,
            business_key: None,
            mutex_key: None,
            retry_count: 0,
            max_retries: 0,
            priority: 0,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            error: None,
            current_node_id: None,
            completed_nodes: HashSet::new(),
            failed_nodes: HashSet::new(),
            lock_owner: None,
            lock_acquired_at: None,
            last_heartbeat: None,
            assigned_engine_id: None,
        }
    }

    /// Whether the current lease (if any) has expired as of `now`.
    fn lease_expired(&self, lease_ttl: Duration, now: DateTime<Utc>) -> bool {
        match self.last_heartbeat {
            None => true,
            Some(hb) => now.signed_duration_since(hb) > chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::zero()),
        }
    }

    /// CAS lease acquisition: succeeds when unowned or the current owner's
    /// lease has expired. On first acquisition this also sets `started_at`
    /// and flips status to `Running`.
    pub fn try_acquire_lease(
        &mut self,
        engine_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::fatal(format!(
                "cannot acquire lease on terminal instance {}",
                self.id
            )));
        }
        let available = self.lock_owner.is_none() || self.lease_expired(lease_ttl, now);
        if !available && self.lock_owner.as_deref() != Some(engine_id) {
            return Err(CoreError::lease_lost(format!(
                "instance {} already leased by another engine",
                self.id
            )));
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = InstanceStatus::Running;
        self.lock_owner = Some(engine_id.to_string());
        self.lock_acquired_at = Some(now);
        self.last_heartbeat = Some(now);
        self.assigned_engine_id = Some(engine_id.to_string());
        Ok(())
    }

    /// Must be called at least every `lease_ttl / 3`; rejects callers who no
    /// longer hold the lease so a reclaimed instance's original owner aborts
    /// cleanly instead of clobbering the new owner's writes.
    pub fn heartbeat(&mut self, engine_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.lock_owner.as_deref() != Some(engine_id) {
            return Err(CoreError::lease_lost(format!(
                "instance {} is no longer leased by {engine_id}",
                self.id
            )));
        }
        self.last_heartbeat = Some(now);
        Ok(())
    }

    pub fn pause(&mut self) {
        self.status = InstanceStatus::Paused;
        self.paused_at = Some(Utc::now());
    }

    pub fn resume(&mut self) {
        self.status = InstanceStatus::Running;
        self.paused_at = None;
    }

    pub fn complete(&mut self, output: Value) {
        self.status = InstanceStatus::Completed;
        self.output_data = output;
        self.completed_at = Some(Utc::now());
        self.lock_owner = None;
    }

    pub fn fail(&mut self, error: CoreError) {
        self.status = InstanceStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        self.lock_owner = None;
    }

    pub fn cancel(&mut self) {
        self.status = InstanceStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.lock_owner = None;
    }

    pub fn record_node_completed(&mut self, node_id: impl Into<String>) {
        self.completed_nodes.insert(node_id.into());
    }

    pub fn record_node_failed(&mut self, node_id: impl Into<String>) {
        self.failed_nodes.insert(node_id.into());
    }

    /// Merges `patch` into the mutable context bag used by the variable
    /// context builder; never replaces the whole object.
    pub fn merge_context(&mut self, patch: HashMap<String, Value>) {
        let obj = self
            .context_data
            .as_object_mut()
            .expect("context_data is always a JSON object");
        for (k, v) in patch {
            obj.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_acquisition_sets_started_at_once() {
        let mut inst = WorkflowInstance::new(Uuid::now_v7(), Value::Null);
        let t0 = Utc::now();
        inst.try_acquire_lease("engine-1", Duration::from_secs(60), t0).unwrap();
        let started = inst.started_at.unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        inst.heartbeat("engine-1", t1).unwrap();
        inst.try_acquire_lease("engine-1", Duration::from_secs(60), t1).unwrap();
        assert_eq!(inst.started_at, Some(started));
    }

    #[test]
    fn heartbeat_from_non_owner_is_rejected() {
        let mut inst = WorkflowInstance::new(Uuid::now_v7(), Value::Null);
        inst.try_acquire_lease("engine-1", Duration::from_secs(60), Utc::now()).unwrap();
        assert!(inst.heartbeat("engine-2", Utc::now()).is_err());
    }

    #[test]
    fn expired_lease_is_reclaimable_by_another_engine() {
        let mut inst = WorkflowInstance::new(Uuid::now_v7(), Value::Null);
        let t0 = Utc::now();
        inst.try_acquire_lease("engine-1", Duration::from_secs(60), t0).unwrap();
        let later = t0 + chrono::Duration::seconds(61);
        inst.try_acquire_lease("engine-2", Duration::from_secs(60), later).unwrap();
        assert_eq!(inst.lock_owner.as_deref(), Some("engine-2"));
    }

    #[test]
    fn cannot_lease_a_terminal_instance() {
        let mut inst = WorkflowInstance::new(Uuid::now_v7(), Value::Null);
        inst.try_acquire_lease("engine-1", Duration::from_secs(60), Utc::now()).unwrap();
        inst.complete(Value::Null);
        assert!(inst.try_acquire_lease("engine-2", Duration::from_secs(60), Utc::now()).is_err());
    }
}
