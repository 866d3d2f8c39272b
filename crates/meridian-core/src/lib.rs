//! # Workflow and Task Orchestration Engine
//!
//! A Postgres-backed engine for dependency-graph workflows: durable
//! instances leased by competing engines, a pluggable executor registry, a
//! cron scheduler with crash recovery, and a backpressure-aware durable
//! queue for work that runs outside any workflow graph.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     EngineDispatcher (C6)                    │
//! │  ready-node resolution, context building, executor calls     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    persistence::{InMemory,Postgres}Store      │
//! │  workflow definitions / instances / nodes / schedules/queue   │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲                ▲
//!                              │                │
//! ┌────────────────────────────┘    ┌───────────┴───────────────┐
//! │   scheduler::Scheduler (C7)      │    processor::JobProcessor (C11) │
//! │   cron timers -> instance/job     │   claim -> execute -> ack/nack  │
//! └───────────────────────────────┘    └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use meridian_core::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let mut registry = ExecutorRegistry::new();
//! registry.register(Arc::new(MyExecutor));
//! let dispatcher = EngineDispatcher::new(store, Arc::new(registry), EngineConfig::default());
//! dispatcher.start()?;
//! ```

pub mod config;
pub mod context;
pub mod cron_expr;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod executor;
pub mod model;
pub mod persistence;
pub mod processor;
pub mod queue;
pub mod reliability;
pub mod scheduler;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::context::{ContextBuilder, ContextMode};
    pub use crate::cron_expr;
    pub use crate::dependency::{DependencyResolver, Readiness};
    pub use crate::engine::{EngineConfig, EngineDispatcher, EngineError, EngineStatus};
    pub use crate::error::{CoreError, ErrorKind};
    pub use crate::executor::{
        ExecutionOutcome, Executor, ExecutorContext, ExecutorHealth, ExecutorRegistry,
        InstanceView, NodeView, RegistryError, ValidationResult,
    };
    pub use crate::model::{
        DefinitionStatus, GroupStatus, InstanceStatus, JobStatus, NodeSpec, NodeStatus, NodeType,
        QueueGroup, QueueJob, ScheduleDefinition, ScheduleExecution, ScheduleExecutionStatus,
        ScheduleTarget, TaskNode, WorkflowDefinition, WorkflowInstance, WorkflowSpec,
    };
    pub use crate::persistence::{
        DefinitionFilter, InMemoryStore, InstanceFilter, Pagination, PostgresStore, QueueRepo,
        ScheduleExecutionRepo, ScheduleRepo, StoreError, TaskNodeRepo, WorkflowDefinitionRepo,
        WorkflowInstanceRepo,
    };
    pub use crate::processor::{JobProcessor, ProcessorConfig, ProcessorError, ProcessorStatus};
    pub use crate::queue::{
        BackpressureConfig, BackpressureManager, BandTransition, WatermarkBand, WatermarkConfig,
        WatermarkMonitor,
    };
    pub use crate::reliability::{
        CircuitBreakerConfig, CircuitBreakerStore, CircuitState, DistributedCircuitBreaker,
        RetryPolicy, TimeoutConfig, TimeoutManager, TimeoutType,
    };
    pub use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
}
