//! The persistent data model.
//!
//! Every type here is owned by its store; in-memory copies held by the
//! engine, scheduler, or queue are caches, never the source of truth.

mod definition;
mod instance;
mod node;
mod queue;
mod schedule;

pub use definition::{DefinitionStatus, NodeSpec, NodeType, WorkflowDefinition, WorkflowSpec};
pub use instance::{InstanceStatus, WorkflowInstance};
pub use node::{NodeStatus, TaskNode};
pub use queue::{GroupStatus, JobStatus, QueueGroup, QueueJob};
pub use schedule::{ScheduleDefinition, ScheduleExecution, ScheduleExecutionStatus, ScheduleTarget};
