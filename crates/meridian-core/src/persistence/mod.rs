//! Persistence layer: repository contracts plus an in-memory and a Postgres
//! implementation of each.
//!
//! - [`InMemoryStore`] backs unit tests and local development.
//! - [`PostgresStore`] is the production implementation.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    DefinitionFilter, InstanceFilter, Pagination, QueueRepo, ScheduleExecutionRepo, ScheduleRepo,
    StoreError, TaskNodeRepo, WorkflowDefinitionRepo, WorkflowInstanceRepo,
};
