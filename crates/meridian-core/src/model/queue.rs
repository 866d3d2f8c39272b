//! `QueueJob` and `QueueGroup` — the durable queue's unit of work.
//!
//! Distinct from [`super::TaskNode`]: queue jobs run outside any workflow
//! graph (e.g. cron-triggered jobs dispatched straight to an executor).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Executing,
    Delayed,
    Paused,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub queue_name: String,
    pub group_id: Option<String>,
    pub job_name: String,
    pub executor_name: String,
    pub payload: Value,
    pub result: Value,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub delay_until: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub error: Option<CoreError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub fn new(
        queue_name: impl Into<String>,
        job_name: impl Into<String>,
        executor_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            queue_name: queue_name.into(),
            group_id: None,
            job_name: job_name.into(),
            executor_name: executor_name.into(),
            payload,
            result: Value::Null,
            status: JobStatus::Waiting,
            priority: 0,
            attempts: 0,
            max_attempts: 5,
            delay_until: None,
            locked_at: None,
            locked_by: None,
            locked_until: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            failed_at: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.delay_until.map(|t| t <= now).unwrap_or(true),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueGroup {
    pub id: Uuid,
    pub queue_name: String,
    pub group_id: String,
    pub status: GroupStatus,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

impl QueueGroup {
    pub fn new(queue_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue_name: queue_name.into(),
            group_id: group_id.into(),
            status: GroupStatus::Active,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
        }
    }

    /// `total_jobs = completed_jobs + failed_jobs + live (waiting/executing/delayed) count`.
    pub fn live_count(&self) -> u64 {
        self.total_jobs
            .saturating_sub(self.completed_jobs)
            .saturating_sub(self.failed_jobs)
    }
}
