//! Process configuration, loaded from the environment.

use std::time::Duration;

use crate::engine::EngineConfig;
use crate::processor::ProcessorConfig;
use crate::queue::{BackpressureConfig, WatermarkConfig};
use crate::scheduler::SchedulerConfig;

/// Top-level configuration for the `meridian-engine` binary, assembled from
/// environment variables with the same component defaults the library uses
/// when constructed directly.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub processor: ProcessorConfig,
    pub watermark: WatermarkConfig,
    pub backpressure: BackpressureConfig,
}

impl AppConfig {
    /// Reads configuration from the environment, falling back to component
    /// defaults for anything unset. Panics on a missing `DATABASE_URL`,
    /// mirroring how the rest of the workspace treats that variable as
    /// mandatory rather than optional.
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required");
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let mut engine = EngineConfig::default();
        if let Some(id) = env_string("ENGINE_ID") {
            engine.engine_id = id;
        }
        if let Some(n) = env_usize("ENGINE_MAX_CONCURRENCY") {
            engine.max_concurrency = n;
        }
        if let Some(d) = env_millis("ENGINE_LEASE_TTL_MS") {
            engine.lease_ttl = d;
        }

        let mut processor = ProcessorConfig::default();
        if let Some(id) = env_string("PROCESSOR_ID") {
            processor.processor_id = id;
        }
        if let Some(q) = env_string("PROCESSOR_QUEUE_NAME") {
            processor.queue_name = q;
        }
        if let Some(n) = env_usize("PROCESSOR_MAX_CONCURRENCY") {
            processor.max_concurrency = n;
        }

        let mut scheduler = SchedulerConfig::default();
        if let Some(n) = env_usize("SCHEDULER_MAX_CONCURRENCY") {
            scheduler.max_concurrency = n;
        }

        Self {
            database_url,
            bind_addr,
            engine,
            scheduler,
            processor,
            watermark: WatermarkConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).map(Duration::from_millis)
}
