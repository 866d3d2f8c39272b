//! `WorkflowDefinition` — a versioned, immutable template for instances.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::reliability::RetryPolicy;
use crate::reliability::TimeoutConfig;

/// Lifecycle status of a definition.
///
/// `draft -> active -> deprecated -> archived`, with the invariant that at
/// most one version per `name` may be `Active` with `is_active = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Deprecated,
    Archived,
}

/// Shape of a task node inside a definition's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Simple,
    Parallel,
    Loop,
    Branch,
}

/// One node in a [`WorkflowSpec`] graph, not yet bound to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub executor_name: String,
    #[serde(default)]
    pub executor_config: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parallel_group_id: Option<String>,
    /// Name of a context key whose truthiness gates execution. Only consulted
    /// for `NodeType::Branch`; guard=false transitions the node straight to
    /// `Skipped` without ever being returned as executable.
    #[serde(default)]
    pub branch_guard: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

/// The opaque DAG carried by a definition: nodes plus their dependency edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowSpec {
    /// Validates node-id uniqueness, dangling dependency references, and
    /// acyclicity. Called once at instance-creation time; the resolver never
    /// re-validates topology at runtime.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(CoreError::validation(format!(
                    "duplicate node_id '{}'",
                    node.node_id
                )));
            }
        }
        let known: HashSet<&str> = self.nodes.iter().map(|n| n.node_id.as_str()).collect();
        for node in &self.nodes {
            for dep in &node.dependencies {
                if !known.contains(dep.as_str()) {
                    return Err(CoreError::validation(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.node_id, dep
                    )));
                }
            }
        }
        self.check_acyclic()?;
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), CoreError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let by_id: HashMap<&str, &NodeSpec> =
            self.nodes.iter().map(|n| (n.node_id.as_str(), n)).collect();
        let mut marks: HashMap<&str, Mark> =
            self.nodes.iter().map(|n| (n.node_id.as_str(), Mark::Unvisited)).collect();

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a NodeSpec>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), CoreError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(CoreError::validation(format!(
                        "cyclic dependency detected through node '{id}'"
                    )))
                }
                _ => {}
            }
            marks.insert(id, Mark::InProgress);
            if let Some(node) = by_id.get(id) {
                for dep in &node.dependencies {
                    visit(dep.as_str(), by_id, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for id in by_id.keys() {
            visit(id, &by_id, &mut marks)?;
        }
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// A versioned, named template for workflow instances.
///
/// Key is `(name, version)`; once any instance references a version, that
/// version's `spec` is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub display_name: String,
    pub description: Option<String>,
    pub status: DefinitionStatus,
    pub is_active: bool,
    pub category: Option<String>,
    pub tags: HashSet<String>,
    pub spec: WorkflowSpec,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: i32, spec: WorkflowSpec) -> Self {
        let now = chrono::Utc::now();
        let name = name.into();
        Self {
            id: Uuid::now_v7(),
            display_name: name.clone(),
            name,
            version,
            description: None,
            status: DefinitionStatus::Draft,
            is_active: false,
            category: None,
            tags: HashSet::new(),
            spec,
            created_at: now,
            updated_at: now,
        }
    }

    /// Activates this version, which the repository must pair with atomic
    /// deactivation of any prior active sibling for the same `name`.
    pub fn activate(&mut self) {
        self.status = DefinitionStatus::Active;
        self.is_active = true;
        self.updated_at = chrono::Utc::now();
    }

    pub fn deprecate(&mut self) {
        self.status = DefinitionStatus::Deprecated;
        self.is_active = false;
        self.updated_at = chrono::Utc::now();
    }

    pub fn archive(&mut self) {
        self.status = DefinitionStatus::Archived;
        self.is_active = false;
        self.updated_at = chrono::Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            node_id: id.to_string(),
            node_name: id.to_string(),
            node_type: NodeType::Simple,
            executor_name: "echo".to_string(),
            executor_config: Value::Null,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            parallel_group_id: None,
            branch_guard: None,
            retry_policy: RetryPolicy::default(),
            timeout: TimeoutConfig::default(),
        }
    }

    #[test]
    fn linear_chain_validates() {
        let spec = WorkflowSpec {
            nodes: vec![node("A", &[]), node("B", &["A"]), node("C", &["B"])],
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_cycle() {
        let spec = WorkflowSpec {
            nodes: vec![node("A", &["B"]), node("B", &["A"])],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_dangling_dependency() {
        let spec = WorkflowSpec {
            nodes: vec![node("A", &["ghost"])],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_node_id() {
        let spec = WorkflowSpec {
            nodes: vec![node("A", &[]), node("A", &[])],
        };
        assert!(spec.validate().is_err());
    }
}
