//! `meridian-engine` — runs the engine dispatcher, scheduler, and job
//! processor against Postgres, with a small admin/health HTTP surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use meridian_core::prelude::*;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AdminState {
    store: Arc<PostgresStore>,
    watermark: Arc<WatermarkMonitor>,
    backpressure: Arc<BackpressureManager>,
    engine: Arc<EngineDispatcher<PostgresStore>>,
    scheduler: Arc<Scheduler<PostgresStore>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    engine_status: String,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine_status: format!("{:?}", state.engine.status()),
    })
}

#[derive(Serialize)]
struct QueueDepthResponse {
    queue_name: String,
    depth: i64,
    band: String,
}

async fn queue_depth(State(state): State<AdminState>) -> Json<QueueDepthResponse> {
    let depth = state
        .store
        .depth("default")
        .await
        .unwrap_or_default();
    if let Some(transition) = state.watermark.observe(depth) {
        tracing::info!(?transition, "watermark band transition");
    }
    Json(QueueDepthResponse {
        queue_name: "default".to_string(),
        depth,
        band: format!("{:?}", state.watermark.band()),
    })
}

#[derive(Serialize)]
struct SchedulerStatusResponse {
    armed_timers: usize,
}

async fn scheduler_status(State(state): State<AdminState>) -> Json<SchedulerStatusResponse> {
    Json(SchedulerStatusResponse { armed_timers: state.scheduler.timer_count() })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meridian_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    tracing::info!(bind_addr = %config.bind_addr, "meridian-engine starting");

    let store = Arc::new(
        PostgresStore::from_url(&config.database_url)
            .await
            .context("failed to connect to Postgres")?,
    );

    let mut registry = ExecutorRegistry::new();
    register_builtin_executors(&mut registry);
    let registry = Arc::new(registry);

    let watermark = Arc::new(WatermarkMonitor::new(config.watermark.clone()));
    let backpressure = Arc::new(BackpressureManager::new(config.backpressure.clone()));

    let engine = EngineDispatcher::new(Arc::clone(&store), Arc::clone(&registry), config.engine.clone());
    engine.start().context("failed to start engine dispatcher")?;

    let scheduler = Scheduler::new(Arc::clone(&store), config.scheduler.clone());
    scheduler.start().await.context("failed to start scheduler")?;

    let processor = JobProcessor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.processor.clone(),
        Arc::clone(&backpressure),
        Arc::clone(&watermark),
    );
    processor.start().context("failed to start job processor")?;

    let admin_state = AdminState {
        store: Arc::clone(&store),
        watermark: Arc::clone(&watermark),
        backpressure: Arc::clone(&backpressure),
        engine: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/admin/queue-depth", get(queue_depth))
        .route("/admin/scheduler", get(scheduler_status))
        .with_state(admin_state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("failed to bind admin HTTP listener")?;
    tracing::info!(bind_addr = %config.bind_addr, "admin HTTP surface listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("admin HTTP server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    processor.shutdown().await.ok();
    scheduler.shutdown().await;
    engine.shutdown().await.ok();

    Ok(())
}

/// Executors shipped with the binary. Hosts embedding the library instead
/// register their own via [`ExecutorRegistry::register`].
fn register_builtin_executors(_registry: &mut ExecutorRegistry) {}
