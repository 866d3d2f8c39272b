//! `TaskNode` — instantiation of a [`super::NodeSpec`] inside one instance.
//!
//! Implements the task-node state machine: `pending -> running -> {completed |
//! failed | skipped | cancelled}`, with `failed -> pending` when retry budget
//! remains. All terminal transitions are write-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::NodeType;
use crate::error::CoreError;
use crate::reliability::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
        // Failed is terminal only once retries are exhausted; callers decide
        // that via `TaskNode::fail`, so it is deliberately not listed here.
    }
}

/// A node inside one workflow instance, bound to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub instance_id: Uuid,
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub executor_name: String,
    pub executor_config: Value,
    pub status: NodeStatus,
    pub input_data: Value,
    pub output_data: Value,
    pub dependencies: Vec<String>,
    pub parallel_group_id: Option<String>,
    pub parent_node_id: Option<String>,
    /// Context key whose truthiness gates this node, copied from the owning
    /// [`super::definition::NodeSpec`] so the resolver never needs the
    /// definition's spec to evaluate a branch.
    pub branch_guard: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub error: Option<CoreError>,
    pub assigned_engine_id: Option<String>,
    pub lock_owner: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Earliest time this node may be dispatched again after a retry.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub fn new(instance_id: Uuid, spec: &super::definition::NodeSpec) -> Self {
        Self {
            instance_id,
            node_id: spec.node_id.clone(),
            node_name: spec.node_name.clone(),
            node_type: spec.node_type,
            executor_name: spec.executor_name.clone(),
            executor_config: spec.executor_config.clone(),
            status: NodeStatus::Pending,
            input_data: Value::Null,
            output_data: Value::Null,
            dependencies: spec.dependencies.clone(),
            parallel_group_id: spec.parallel_group_id.clone(),
            parent_node_id: None,
            branch_guard: spec.branch_guard.clone(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
            max_retries: spec.retry_policy.max_attempts.saturating_sub(1),
            retry_policy: spec.retry_policy.clone(),
            error: None,
            assigned_engine_id: None,
            lock_owner: None,
            last_heartbeat: None,
            next_attempt_at: None,
        }
    }

    /// `pending -> running` via CAS: only succeeds when unowned. Idempotent
    /// for the same engine re-attempting on an already-owned node.
    pub fn start(&mut self, engine_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status != NodeStatus::Pending {
            if self.status == NodeStatus::Running && self.lock_owner.as_deref() == Some(engine_id)
            {
                return Ok(());
            }
            return Err(CoreError::fatal(format!(
                "node {} is not pending (status={:?})",
                self.node_id, self.status
            )));
        }
        if self.lock_owner.is_some() {
            return Err(CoreError::lease_lost(format!(
                "node {} already locked",
                self.node_id
            )));
        }
        self.status = NodeStatus::Running;
        self.lock_owner = Some(engine_id.to_string());
        self.assigned_engine_id = Some(engine_id.to_string());
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        Ok(())
    }

    pub fn heartbeat(&mut self, engine_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.lock_owner.as_deref() != Some(engine_id) {
            return Err(CoreError::lease_lost(format!(
                "node {} is no longer leased by {engine_id}",
                self.node_id
            )));
        }
        self.last_heartbeat = Some(now);
        Ok(())
    }

    /// Write-once terminal success transition.
    pub fn complete(&mut self, output: Value) -> Result<(), CoreError> {
        self.reject_if_terminal()?;
        let now = Utc::now();
        self.status = NodeStatus::Completed;
        self.output_data = output;
        self.completed_at = Some(now);
        self.duration_ms = self.started_at.map(|s| (now - s).num_milliseconds());
        self.lock_owner = None;
        Ok(())
    }

    /// Either reverts to `pending` for a retry, or becomes terminally
    /// `failed`, depending on retry budget and whether `error` is retryable.
    pub fn fail(&mut self, error: CoreError) -> Result<(), CoreError> {
        self.reject_if_terminal()?;
        let exhausted = self.retry_count >= self.max_retries;
        if exhausted || !error.is_retryable() {
            self.status = NodeStatus::Failed;
            self.completed_at = Some(Utc::now());
            self.error = Some(error);
            self.lock_owner = None;
            return Ok(());
        }
        self.retry_count += 1;
        self.error = Some(error);
        self.status = NodeStatus::Pending;
        self.lock_owner = None;
        self.started_at = None;
        let delay = self.retry_policy.delay_for_attempt(self.retry_count + 1);
        self.next_attempt_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        Ok(())
    }

    pub fn is_failed_terminal(&self) -> bool {
        self.status == NodeStatus::Failed
    }

    /// Branch nodes whose guard evaluated false never run.
    pub fn skip(&mut self) -> Result<(), CoreError> {
        self.reject_if_terminal()?;
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), CoreError> {
        if self.status.is_terminal() || self.status == NodeStatus::Failed {
            return Ok(());
        }
        self.status = NodeStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.lock_owner = None;
        Ok(())
    }

    pub fn is_ready_to_dispatch(&self, now: DateTime<Utc>) -> bool {
        self.status == NodeStatus::Pending
            && self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }

    fn reject_if_terminal(&self) -> Result<(), CoreError> {
        if self.status.is_terminal() || self.status == NodeStatus::Failed {
            return Err(CoreError::fatal(format!(
                "node {} already in terminal state {:?}",
                self.node_id, self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::definition::{NodeSpec, NodeType};

    fn spec() -> NodeSpec {
        NodeSpec {
            node_id: "A".into(),
            node_name: "A".into(),
            node_type: NodeType::Simple,
            executor_name: "echo".into(),
            executor_config: Value::Null,
            dependencies: vec![],
            parallel_group_id: None,
            branch_guard: None,
            retry_policy: RetryPolicy::fixed(std::time::Duration::from_millis(10), 3),
            timeout: Default::default(),
        }
    }

    #[test]
    fn start_is_idempotent_for_same_engine() {
        let mut node = TaskNode::new(Uuid::now_v7(), &spec());
        node.start("e1", Utc::now()).unwrap();
        assert!(node.start("e1", Utc::now()).is_ok());
    }

    #[test]
    fn start_rejects_other_engine_while_locked() {
        let mut node = TaskNode::new(Uuid::now_v7(), &spec());
        node.start("e1", Utc::now()).unwrap();
        node.status = NodeStatus::Pending; // simulate a racing CAS read
        assert!(node.start("e2", Utc::now()).is_err());
    }

    #[test]
    fn completed_at_never_precedes_started_at() {
        let mut node = TaskNode::new(Uuid::now_v7(), &spec());
        node.start("e1", Utc::now()).unwrap();
        node.complete(Value::Null).unwrap();
        assert!(node.completed_at.unwrap() >= node.started_at.unwrap());
    }

    #[test]
    fn failure_retries_until_budget_exhausted_then_terminal() {
        let mut node = TaskNode::new(Uuid::now_v7(), &spec());
        assert_eq!(node.max_retries, 2);
        node.start("e1", Utc::now()).unwrap();
        node.fail(CoreError::executor_failure("boom")).unwrap();
        assert_eq!(node.status, NodeStatus::Pending);
        assert_eq!(node.retry_count, 1);

        node.start("e1", Utc::now()).unwrap();
        node.fail(CoreError::executor_failure("boom")).unwrap();
        assert_eq!(node.status, NodeStatus::Pending);
        assert_eq!(node.retry_count, 2);

        node.start("e1", Utc::now()).unwrap();
        node.fail(CoreError::executor_failure("boom")).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
    }

    #[test]
    fn non_retryable_error_fails_immediately() {
        let mut node = TaskNode::new(Uuid::now_v7(), &spec());
        node.start("e1", Utc::now()).unwrap();
        node.fail(CoreError::validation("bad input")).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.retry_count, 0);
    }

    #[test]
    fn terminal_transition_is_write_once() {
        let mut node = TaskNode::new(Uuid::now_v7(), &spec());
        node.start("e1", Utc::now()).unwrap();
        node.complete(Value::Null).unwrap();
        assert!(node.complete(Value::Null).is_err());
    }
}
