//! Scheduler (C7): cron-triggered launching of queue jobs and workflow
//! instances.

mod scheduler;

pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
