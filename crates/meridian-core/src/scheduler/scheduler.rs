//! Scheduler (C7): one single-shot timer per enabled schedule, firing a
//! queue job or a new workflow instance at the times its cron expression
//! names.
//!
//! Mirrors the teacher's `WorkerPool` shutdown shape (a `watch` broadcast
//! plus a periodic background task) but keeps a `DashMap<schedule_id,
//! JoinHandle>` instead of a semaphore, since each schedule owns exactly
//! one pending timer rather than competing for a shared pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::model::{
    ScheduleDefinition, ScheduleExecution, ScheduleTarget, TaskNode, WorkflowInstance,
};
use crate::persistence::{
    QueueRepo, ScheduleExecutionRepo, ScheduleRepo, StoreError, TaskNodeRepo,
    WorkflowDefinitionRepo, WorkflowInstanceRepo,
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on schedules firing concurrently; a firing beyond this
    /// bound is rescheduled `concurrency_retry_delay` later rather than run.
    pub max_concurrency: usize,
    pub concurrency_retry_delay: Duration,
    /// How often the recovery sweep re-reads enabled schedules and arms
    /// any missing timers (process-down recovery).
    pub recovery_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            concurrency_retry_delay: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cron error: {0}")]
    Cron(#[from] crate::error::CoreError),
}

/// Drives cron-triggered firings for every enabled schedule in the store.
/// `S` must implement every repo trait the scheduler touches; both
/// [`crate::persistence::InMemoryStore`] and [`crate::persistence::PostgresStore`]
/// qualify.
pub struct Scheduler<S> {
    store: Arc<S>,
    config: SchedulerConfig,
    timers: DashMap<Uuid, JoinHandle<()>>,
    running_tasks: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    recovery_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S> Scheduler<S>
where
    S: ScheduleRepo
        + ScheduleExecutionRepo
        + QueueRepo
        + WorkflowDefinitionRepo
        + WorkflowInstanceRepo
        + TaskNodeRepo
        + Send
        + Sync
        + 'static,
{
    pub fn new(store: Arc<S>, config: SchedulerConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            config,
            timers: DashMap::new(),
            running_tasks: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            shutdown_rx,
            recovery_handle: std::sync::Mutex::new(None),
        })
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        info!("starting scheduler");
        self.reload().await?;

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.recovery_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = scheduler.reload().await {
                            error!(error = %e, "scheduler recovery reload failed");
                        }
                    }
                }
            }
        });
        *self.recovery_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.recovery_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
    }

    /// Re-reads enabled schedules and arms a timer for any that don't have
    /// one yet. Idempotent: calling twice in a row leaves the timer map
    /// structurally unchanged the second time.
    #[instrument(skip(self))]
    pub async fn reload(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let schedules = self.store.list_enabled().await?;
        for schedule in schedules {
            if self.timers.contains_key(&schedule.id) {
                continue;
            }
            self.arm(schedule).await?;
        }
        Ok(())
    }

    pub async fn pause(&self, schedule_id: Uuid) -> Result<(), SchedulerError> {
        self.store.set_enabled(schedule_id, false).await?;
        if let Some((_, handle)) = self.timers.remove(&schedule_id) {
            handle.abort();
        }
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, schedule_id: Uuid) -> Result<(), SchedulerError> {
        self.store.set_enabled(schedule_id, true).await?;
        if let Some(schedule) = self.store.find_by_id(schedule_id).await? {
            self.arm(schedule).await?;
        }
        Ok(())
    }

    /// Computes `next_run_at` if missing, persists it, and schedules a
    /// single-shot timer for the delay until that instant.
    async fn arm(self: &Arc<Self>, mut schedule: ScheduleDefinition) -> Result<(), SchedulerError> {
        let parsed = crate::cron_expr::parse(&schedule.cron_expression)?;
        let now = Utc::now();
        let next_run_at = match schedule.next_run_at {
            Some(t) if t > now => t,
            _ => crate::cron_expr::next_after(&parsed, now.with_timezone(&schedule.timezone))
                .ok_or_else(|| crate::error::CoreError::validation("cron expression never fires again"))?,
        };
        if schedule.next_run_at != Some(next_run_at) {
            schedule.next_run_at = Some(next_run_at);
            schedule = self.store.update(schedule).await?;
        }

        let delay = (next_run_at - now).to_std().unwrap_or(Duration::ZERO);
        let scheduler = Arc::clone(self);
        let schedule_id = schedule.id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(schedule_id).await;
        });
        self.timers.insert(schedule_id, handle);
        Ok(())
    }

    /// Fires one schedule, then re-arms its next timer. Never fires earlier
    /// than `next_run_at`; if the concurrency cap is hit, retries after
    /// `concurrency_retry_delay` without consuming this firing.
    #[instrument(skip(self))]
    async fn fire(self: Arc<Self>, schedule_id: Uuid) {
        let Ok(Some(schedule)) = self.store.find_by_id(schedule_id).await else {
            debug!(%schedule_id, "schedule vanished before firing, dropping timer");
            return;
        };
        if !schedule.enabled {
            return;
        }

        if self.running_tasks.load(Ordering::SeqCst) >= self.config.max_concurrency {
            warn!(%schedule_id, "concurrency cap reached, deferring firing");
            let scheduler = Arc::clone(&self);
            let delay = self.config.concurrency_retry_delay;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                scheduler.fire(schedule_id).await;
            });
            self.timers.insert(schedule_id, handle);
            return;
        }

        self.running_tasks.fetch_add(1, Ordering::SeqCst);
        let trigger_time = Utc::now();
        let mut execution = ScheduleExecution::start(schedule_id, trigger_time);

        match self.dispatch_target(&schedule).await {
            Ok(()) => execution.succeed(),
            Err(e) => {
                error!(%schedule_id, error = %e, "schedule firing failed");
                execution.fail(crate::error::CoreError::transient(e.to_string()));
            }
        }
        let _ = self.store.create(execution).await;
        self.running_tasks.fetch_sub(1, Ordering::SeqCst);

        match crate::cron_expr::parse(&schedule.cron_expression) {
            Ok(parsed) => {
                let mut schedule = schedule;
                schedule.last_run_at = Some(trigger_time);
                let tz = schedule.timezone;
                schedule.next_run_at =
                    crate::cron_expr::next_after(&parsed, Utc::now().with_timezone(&tz));
                if let Ok(schedule) = self.store.update(schedule).await {
                    if let Err(e) = self.arm(schedule).await {
                        error!(%schedule_id, error = %e, "failed to arm next firing");
                    }
                }
            }
            Err(e) => error!(%schedule_id, error = %e, "schedule has an invalid cron expression"),
        }
    }

    async fn dispatch_target(&self, schedule: &ScheduleDefinition) -> Result<(), SchedulerError> {
        match &schedule.target {
            ScheduleTarget::Executor { executor_name } => {
                let mut job = crate::model::QueueJob::new(
                    "scheduled",
                    schedule.name.clone(),
                    executor_name.clone(),
                    schedule.input_data.clone(),
                );
                job.group_id = schedule.mutex_key.clone();
                self.store.enqueue(job).await?;
                Ok(())
            }
            ScheduleTarget::Workflow { workflow_definition_ref } => {
                let definition = self
                    .store
                    .find_by_id(*workflow_definition_ref)
                    .await?
                    .ok_or(StoreError::DefinitionNotFound(*workflow_definition_ref))?;

                let mut instance = WorkflowInstance::new(definition.id, schedule.input_data.clone());
                instance.business_key = schedule.business_key.clone();
                instance.mutex_key = schedule.mutex_key.clone();
                if let Some(obj) = schedule.context_data.as_object() {
                    instance.merge_context(obj.clone().into_iter().collect());
                }
                let instance = self.store.create(instance).await?;
                for spec in &definition.spec.nodes {
                    self.store.create(TaskNode::new(instance.id, spec)).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeSpec, NodeType, WorkflowDefinition, WorkflowSpec};
    use crate::persistence::InMemoryStore;
    use crate::reliability::RetryPolicy;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn node(id: &str) -> NodeSpec {
        NodeSpec {
            node_id: id.into(),
            node_name: id.into(),
            node_type: NodeType::Simple,
            executor_name: "echo".into(),
            executor_config: serde_json::Value::Null,
            dependencies: vec![],
            parallel_group_id: None,
            branch_guard: None,
            retry_policy: RetryPolicy::fixed(StdDuration::from_millis(10), 1),
            timeout: Default::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn executor_target_enqueues_a_job_on_firing() {
        let store = Arc::new(InMemoryStore::new());
        let schedule = ScheduleDefinition::new(
            "every-second",
            ScheduleTarget::Executor { executor_name: "noop".into() },
            "* * * * * *",
            chrono_tz::UTC,
        )
        .unwrap();
        let schedule = store.create(schedule).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
        scheduler.arm(schedule.clone()).await.unwrap();
        assert_eq!(scheduler.timer_count(), 1);

        tokio::time::advance(StdDuration::from_secs(2)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(StdDuration::from_millis(1)).await;

        assert!(store.job_count("scheduled") >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_target_creates_instance_and_nodes_on_firing() {
        let store = Arc::new(InMemoryStore::new());
        let mut definition = WorkflowDefinition::new(
            "demo",
            1,
            WorkflowSpec { nodes: vec![node("a")] },
        );
        definition.activate();
        let definition = store.create(definition).await.unwrap();

        let schedule = ScheduleDefinition::new(
            "fires-workflow",
            ScheduleTarget::Workflow { workflow_definition_ref: definition.id },
            "* * * * * *",
            chrono_tz::UTC,
        )
        .unwrap();
        let mut schedule = store.create(schedule).await.unwrap();
        schedule.input_data = json!({"x": 1});

        let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
        scheduler.arm(schedule).await.unwrap();

        tokio::time::advance(StdDuration::from_secs(2)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(StdDuration::from_millis(1)).await;

        assert_eq!(store.instance_count(), 1);
    }

    #[tokio::test]
    async fn reload_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let schedule = ScheduleDefinition::new(
            "every-minute",
            ScheduleTarget::Executor { executor_name: "noop".into() },
            "0 * * * * *",
            chrono_tz::UTC,
        )
        .unwrap();
        store.create(schedule).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
        scheduler.reload().await.unwrap();
        let first = scheduler.timer_count();
        scheduler.reload().await.unwrap();
        assert_eq!(scheduler.timer_count(), first);
    }

    #[tokio::test]
    async fn pause_removes_timer_and_resume_rearms_it() {
        let store = Arc::new(InMemoryStore::new());
        let schedule = ScheduleDefinition::new(
            "every-minute",
            ScheduleTarget::Executor { executor_name: "noop".into() },
            "0 * * * * *",
            chrono_tz::UTC,
        )
        .unwrap();
        let schedule = store.create(schedule).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
        scheduler.arm(schedule.clone()).await.unwrap();
        assert_eq!(scheduler.timer_count(), 1);

        scheduler.pause(schedule.id).await.unwrap();
        assert_eq!(scheduler.timer_count(), 0);

        scheduler.resume(schedule.id).await.unwrap();
        assert_eq!(scheduler.timer_count(), 1);
    }
}
