//! Variable context builder (C2): assembles the input/context/upstream-output
//! view an executor sees for a given node.
//!
//! Every call produces a fresh [`serde_json::Value`]; neither the instance
//! nor the node's data is mutated.

use serde_json::{json, Map, Value};

use crate::model::{TaskNode, WorkflowInstance};

/// Which upstream nodes populate the `nodes` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Only nodes this node directly depends on.
    DirectPredecessors,
    /// Every node completed so far in the instance.
    AllCompleted,
}

#[derive(Debug, Clone)]
pub struct UpstreamNodeView {
    pub output: Value,
    pub status: String,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<i64>,
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// Builds the nested view an executor receives for node `target`, given
    /// `all_nodes` (every node in the instance, any status).
    pub fn build(
        instance: &WorkflowInstance,
        target: &TaskNode,
        all_nodes: &[TaskNode],
        mode: ContextMode,
    ) -> Value {
        let candidates: Vec<&TaskNode> = match mode {
            ContextMode::DirectPredecessors => all_nodes
                .iter()
                .filter(|n| target.dependencies.contains(&n.node_id))
                .collect(),
            ContextMode::AllCompleted => all_nodes
                .iter()
                .filter(|n| instance.completed_nodes.contains(&n.node_id))
                .collect(),
        };

        let mut nodes_map = Map::new();
        let mut most_recent: Option<&TaskNode> = None;
        for node in &candidates {
            if node.completed_at.is_none() {
                continue;
            }
            nodes_map.insert(
                node.node_id.clone(),
                json!({
                    "output": node.output_data,
                    "status": status_label(node.status),
                    "completedAt": node.completed_at,
                    "durationMs": node.duration_ms,
                }),
            );
            if most_recent.map(|m| m.completed_at < node.completed_at).unwrap_or(true) {
                most_recent = Some(node);
            }
        }

        let mut view = Map::new();
        view.insert("input".into(), instance.input_data.clone());
        view.insert("context".into(), instance.context_data.clone());
        view.insert("nodeInput".into(), target.input_data.clone());
        view.insert("nodes".into(), Value::Object(nodes_map));
        view.insert(
            "previousNodeOutput".into(),
            most_recent.map(|n| n.output_data.clone()).unwrap_or(Value::Null),
        );
        view.insert("flat".into(), flatten(&instance.context_data));
        Value::Object(view)
    }
}

fn status_label(status: crate::model::NodeStatus) -> &'static str {
    use crate::model::NodeStatus::*;
    match status {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
        Cancelled => "cancelled",
    }
}

/// Flattens a nested object into a single-level `a.b.c` keyspace for
/// template-style access, leaving the original nested value untouched.
fn flatten(value: &Value) -> Value {
    let mut out = Map::new();
    flatten_into(value, String::new(), &mut out);
    Value::Object(out)
}

fn flatten_into(value: &Value, prefix: String, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                flatten_into(v, key, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::definition::{NodeSpec, NodeType};
    use crate::reliability::RetryPolicy;
    use uuid::Uuid;

    fn spec(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            node_id: id.into(),
            node_name: id.into(),
            node_type: NodeType::Simple,
            executor_name: "echo".into(),
            executor_config: Value::Null,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            parallel_group_id: None,
            branch_guard: None,
            retry_policy: RetryPolicy::no_retry(),
            timeout: Default::default(),
        }
    }

    #[test]
    fn exposes_upstream_output_and_previous_hint() {
        let instance_id = Uuid::now_v7();
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), json!({"x": 1}));
        instance.id = instance_id;

        let mut a = TaskNode::new(instance_id, &spec("A", &[]));
        a.start("e1", chrono::Utc::now()).unwrap();
        a.complete(json!({"a": true})).unwrap();
        instance.record_node_completed("A");

        let b = TaskNode::new(instance_id, &spec("B", &["A"]));

        let view = ContextBuilder::build(&instance, &b, &[a.clone(), b.clone()], ContextMode::DirectPredecessors);
        assert_eq!(view["nodes"]["A"]["output"], json!({"a": true}));
        assert_eq!(view["previousNodeOutput"], json!({"a": true}));
        assert_eq!(view["input"], json!({"x": 1}));
    }

    #[test]
    fn flattens_context_for_template_access() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), Value::Null);
        instance.merge_context([("a".to_string(), json!({"b": {"c": 3}}))].into_iter().collect());
        let node = TaskNode::new(instance.id, &spec("A", &[]));
        let view = ContextBuilder::build(&instance, &node, &[], ContextMode::AllCompleted);
        assert_eq!(view["flat"]["a.b.c"], json!(3));
    }
}
