//! Job processor (C11): claims durable queue jobs and runs them against the
//! executor registry.
//!
//! Shaped after the teacher's `WorkerPool`: a `watch`-broadcast shutdown
//! signal, a semaphore bounding in-flight jobs, and a handful of background
//! loops (poll, sweep). Concurrency is not fixed like the teacher's pool —
//! each poll recomputes how many slots to offer from the current
//! [`crate::queue::BackpressureManager`] band.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CoreError;
use crate::executor::{ExecutionOutcome, ExecutorContext, ExecutorRegistry, InstanceView, NodeView, RegistryError};
use crate::model::QueueJob;
use crate::persistence::{QueueRepo, StoreError};
use crate::queue::{BackpressureManager, WatermarkMonitor};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub processor_id: String,
    pub queue_name: String,
    pub max_concurrency: usize,
    pub claim_batch_size: i64,
    pub lock_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processor_id: format!("processor-{}", uuid::Uuid::now_v7()),
            queue_name: "default".into(),
            max_concurrency: 10,
            claim_batch_size: 10,
            lock_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            poll_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("processor already running")]
    AlreadyRunning,
    #[error("graceful shutdown timed out with jobs still in flight")]
    ShutdownTimeout,
}

/// Claims jobs from one queue and executes them, one executor call per job.
pub struct JobProcessor<S> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    config: ProcessorConfig,
    backpressure: Arc<BackpressureManager>,
    watermark: Arc<WatermarkMonitor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<ProcessorStatus>,
    active_jobs: Arc<Semaphore>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    sweep_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S> JobProcessor<S>
where
    S: QueueRepo + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: Arc<ExecutorRegistry>,
        config: ProcessorConfig,
        backpressure: Arc<BackpressureManager>,
        watermark: Arc<WatermarkMonitor>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            registry,
            active_jobs: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            backpressure,
            watermark,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(ProcessorStatus::Stopped),
            poll_handle: std::sync::Mutex::new(None),
            sweep_handle: std::sync::Mutex::new(None),
        })
    }

    pub fn processor_id(&self) -> &str {
        &self.config.processor_id
    }

    pub fn status(&self) -> ProcessorStatus {
        *self.status.read()
    }

    #[instrument(skip(self), fields(processor_id = %self.config.processor_id))]
    pub fn start(self: &Arc<Self>) -> Result<(), ProcessorError> {
        {
            let mut status = self.status.write();
            if *status == ProcessorStatus::Running {
                return Err(ProcessorError::AlreadyRunning);
            }
            *status = ProcessorStatus::Running;
        }
        info!(queue = %self.config.queue_name, "starting job processor");

        let processor = Arc::clone(self);
        let poll_handle = tokio::spawn(async move { processor.poll_loop().await });
        *self.poll_handle.lock().unwrap() = Some(poll_handle);

        let processor = Arc::clone(self);
        let sweep_handle = tokio::spawn(async move { processor.sweep_loop().await });
        *self.sweep_handle.lock().unwrap() = Some(sweep_handle);

        Ok(())
    }

    #[instrument(skip(self), fields(processor_id = %self.config.processor_id))]
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        {
            let mut status = self.status.write();
            if *status == ProcessorStatus::Stopped {
                return Ok(());
            }
            *status = ProcessorStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_jobs.available_permits();
            if available == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.max_concurrency - available,
                    "processor shutdown timed out with jobs still running"
                );
                return Err(ProcessorError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        *self.status.write() = ProcessorStatus::Stopped;
        info!("job processor stopped");
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.clone().poll_once().await {
                Ok(claimed) if claimed > 0 => continue,
                Ok(_) => {}
                Err(e) => error!(error = %e, "poll failed"),
            }
            tokio::select! {
                _ = shutdown_rx.changed() => if *shutdown_rx.borrow() { break },
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn poll_once(self: Arc<Self>) -> Result<usize, ProcessorError> {
        let band = self.watermark.band();
        if !self.backpressure.is_stream_active() {
            return Ok(0);
        }
        let now = tokio::time::Instant::now();
        let effective = self.backpressure.effective_concurrency(band, now);
        let available = self.active_jobs.available_permits();
        let n = effective.min(available).min(self.config.claim_batch_size as usize) as i64;
        if n == 0 {
            return Ok(0);
        }

        let jobs = self
            .store
            .claim(&self.config.queue_name, &self.config.processor_id, n, self.config.lock_timeout)
            .await?;
        let claimed = jobs.len();
        for job in jobs {
            let Ok(permit) = Arc::clone(&self.active_jobs).try_acquire_owned() else {
                warn!(job_id = %job.id, "no semaphore permit available for claimed job, re-nacking");
                let _ = self
                    .store
                    .nack(job.id, CoreError::transient("processor at capacity"), true)
                    .await;
                continue;
            };
            let processor = Arc::clone(&self);
            tokio::spawn(async move {
                processor.run_job(job, permit).await;
            });
        }
        Ok(claimed)
    }

    #[instrument(skip(self, job, _permit), fields(job_id = %job.id, executor = %job.executor_name))]
    async fn run_job(&self, mut job: QueueJob, _permit: tokio::sync::OwnedSemaphorePermit) {
        let heartbeat_job_id = job.id;
        let processor_id = self.config.processor_id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let lock_timeout = self.config.lock_timeout;
        let store = Arc::clone(&self.heartbeat_store());
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_interval).await;
                if store
                    .heartbeat(heartbeat_job_id, &processor_id, lock_timeout)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let outcome = self.execute(&mut job).await;
        heartbeat_task.abort();

        let result = if outcome.success {
            self.store.ack(job.id, outcome.data.unwrap_or(serde_json::Value::Null)).await
        } else {
            let err = CoreError::executor_failure(
                outcome.error.unwrap_or_else(|| "job failed with no error detail".into()),
            );
            let retryable = err.is_retryable() && job.attempts < job.max_attempts;
            self.store.nack(job.id, err, retryable).await
        };
        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "failed to record job outcome");
        }
    }

    fn heartbeat_store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    async fn execute(&self, job: &mut QueueJob) -> ExecutionOutcome {
        let executor = match self.registry.get(&job.executor_name) {
            Ok(executor) => executor,
            Err(e) => return ExecutionOutcome::failure(e.to_string()),
        };
        let ctx = ExecutorContext {
            instance: InstanceView {
                instance_id: job.id,
                business_key: Some(job.job_name.clone()),
                mutex_key: job.group_id.clone(),
            },
            node: NodeView {
                node_id: job.job_name.clone(),
                attempt: job.attempts + 1,
                max_attempts: job.max_attempts,
            },
            config: json!({ "payload": job.payload, "executorConfig": serde_json::Value::Null }),
            cancel: tokio_util::sync::CancellationToken::new(),
            progress: None,
        };
        job.attempts += 1;
        match tokio::time::timeout(self.config.job_timeout, executor.execute(&ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome::failure(format!(
                "job {} timed out after {:?}",
                job.id, self.config.job_timeout
            )),
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => if *shutdown_rx.borrow() { break },
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    match self.store.sweep(&self.config.queue_name).await {
                        Ok(n) if n > 0 => debug!(reclaimed = n, "swept stale queue jobs"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "queue sweep failed"),
                    }
                }
            }
        }
    }
}
