//! `ScheduleDefinition` and `ScheduleExecution` — cron-triggered launchers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

/// What a schedule fires into: a bare executor run via the queue, or a
/// workflow instance start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleTarget {
    Executor { executor_name: String },
    Workflow { workflow_definition_ref: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: Uuid,
    pub name: String,
    pub target: ScheduleTarget,
    pub cron_expression: String,
    pub timezone: chrono_tz::Tz,
    pub enabled: bool,
    pub input_data: Value,
    pub context_data: Value,
    pub business_key: Option<String>,
    pub mutex_key: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        target: ScheduleTarget,
        cron_expression: impl Into<String>,
        timezone: chrono_tz::Tz,
    ) -> Result<Self, CoreError> {
        let cron_expression = cron_expression.into();
        // Validate eagerly so a bad expression never makes it into the store.
        crate::cron_expr::parse(&cron_expression)?;
        Ok(Self {
            id: Uuid::now_v7(),
            name: name.into(),
            target,
            cron_expression,
            timezone,
            enabled: true,
            input_data: Value::Null,
            context_data: Value::Null,
            business_key: None,
            mutex_key: None,
            next_run_at: None,
            last_run_at: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleExecutionStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub status: ScheduleExecutionStatus,
    pub trigger_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<CoreError>,
}

impl ScheduleExecution {
    pub fn start(schedule_id: Uuid, trigger_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            schedule_id,
            status: ScheduleExecutionStatus::Running,
            trigger_time,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn succeed(&mut self) {
        let now = Utc::now();
        self.status = ScheduleExecutionStatus::Success;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }

    pub fn fail(&mut self, error: CoreError) {
        let now = Utc::now();
        self.status = ScheduleExecutionStatus::Failed;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_cron_expression() {
        let result = ScheduleDefinition::new(
            "bad",
            ScheduleTarget::Executor { executor_name: "noop".into() },
            "not a cron",
            chrono_tz::UTC,
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_standard_five_field_expression() {
        let result = ScheduleDefinition::new(
            "every-5-min",
            ScheduleTarget::Executor { executor_name: "noop".into() },
            "0 */5 * * * *",
            chrono_tz::Tz::Asia__Shanghai,
        );
        assert!(result.is_ok());
    }
}
