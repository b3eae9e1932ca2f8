//! Surgegate Server
//!
//! Runs the admission API and the dispatch workers in one process. Several
//! processes can share one Redis counter store; admission limits, backlog
//! depth, sequencing and output pacing are then global across all of them.
//!
//! ## Configuration
//!
//! TOML file (`SURGEGATE_CONFIG` or the standard search paths) with
//! `SURGEGATE_*` environment overrides. See `sg_config::AppConfig`.

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use sg_config::{AppConfig, ConfigLoader, DatabaseConfig};
use sg_engine::{
    api::{create_router, AppState},
    AdmissionController, Dispatcher, DispatcherConfig, DispatchWorker, Downstream, Housekeeper, HttpDownstream,
    IngressService, MockDownstream, OutputPacer, RequestMonitor, Sequencer, StatsAggregator, WorkerConfig,
};
use sg_queue::sqlite::SqliteQueue;
use sg_queue::{EmbeddedQueue, InMemoryQueue, QueueConsumer, QueuePublisher};
use sg_records::sqlite::SqliteRecordStore;
use sg_records::{InMemoryRecordStore, RecordStore};
use sg_store::{
    CounterKeys, CounterStore, InMemoryCounterStore, ReconnectingCounterStore, RedisConnector, RedisCounterStore,
    UnreachableCounterStore,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    sg_common::logging::init_logging("sg-server");

    info!("Starting Surgegate");

    let config = ConfigLoader::new().load().context("Failed to load configuration")?;

    // 1. Metrics recorder
    let prometheus = install_metrics();

    // 2. Counter store
    let store = create_counter_store(&config).await;
    let keys = CounterKeys::new(config.store.key_prefix.clone());

    // 3. Record store and queue
    let pool = open_sqlite_pool(&config.database).await?;
    let records = create_record_store(pool.clone()).await?;
    let (publisher, consumer) = create_queue(&config, pool).await?;

    // 4. Downstream
    let downstream = create_downstream(&config)?;

    // 5. Core components
    let admission = Arc::new(AdmissionController::new(
        store.clone(),
        keys.clone(),
        &config.admission,
        config.pacer.output_rps,
    ));
    let monitor = Arc::new(RequestMonitor::new());
    let sequencer = Sequencer::new(store.clone(), &keys);
    if let Err(e) = sequencer.resume_after(records.as_ref()).await {
        warn!(error = %e, "Could not align sequencer with stored records");
    }
    let ingress = Arc::new(IngressService::new(
        admission.clone(),
        sequencer,
        records.clone(),
        publisher,
        monitor.clone(),
    ));

    let worker = Arc::new(DispatchWorker::new(
        records.clone(),
        downstream,
        OutputPacer::new(store.clone(), &keys, config.pacer.output_rps),
        admission.backlog().clone(),
        Housekeeper::new(store.clone(), keys.clone(), config.housekeeping.clone()),
        WorkerConfig::from_config(&config.dispatch, &config.queue),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        consumer.clone(),
        worker,
        DispatcherConfig::from_config(&config.dispatch, &config.queue),
    ));
    let dispatcher_handle = tokio::spawn(dispatcher.clone().run());

    // 6. HTTP API
    let state = AppState {
        ingress,
        records,
        stats: StatsAggregator::new(admission, monitor).with_queue(consumer),
        store,
        prometheus,
    };
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.http.cors_origins));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    log_startup_summary(&config, &addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped, draining dispatcher");
    if !dispatcher.shutdown(DRAIN_TIMEOUT).await {
        warn!("Unfinished jobs will be redelivered after their visibility timeout");
    }
    let _ = dispatcher_handle.await;

    info!("Surgegate shutdown complete");
    Ok(())
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            sg_engine::metrics::describe_metrics();
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder, /metrics will be empty");
            None
        }
    }
}

/// Connect to the configured counter store.
///
/// An unreachable Redis does not stop startup: the core runs degraded, every
/// component falls back to its local behaviour, and the connection is retried
/// in the background until Redis answers.
async fn create_counter_store(config: &AppConfig) -> Arc<dyn CounterStore> {
    match config.store.backend.as_str() {
        "memory" => {
            warn!("Using in-process counter store; limits are not shared across processes");
            Arc::new(InMemoryCounterStore::new())
        }
        _ => match RedisCounterStore::connect(&config.store.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Counter store unreachable, starting in degraded mode");
                let store = Arc::new(ReconnectingCounterStore::new(Arc::new(UnreachableCounterStore::new(
                    e.to_string(),
                ))));
                store.spawn_reconnect(
                    Arc::new(RedisConnector::new(config.store.redis_url.clone())),
                    Duration::from_millis(config.store.reconnect_initial_ms),
                    Duration::from_millis(config.store.reconnect_max_ms),
                );
                store
            }
        },
    }
}

async fn open_sqlite_pool(database: &DatabaseConfig) -> Result<Option<SqlitePool>> {
    if database.url == "memory" {
        return Ok(None);
    }

    // mode=rwc creates the file but not its directory
    if let Some(parent) = sqlite_file_path(&database.url).and_then(|p| std::path::Path::new(p).parent()) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(database.max_connections)
        .connect(&database.url)
        .await
        .with_context(|| format!("Failed to open database {}", database.url))?;
    info!(url = %database.url, "Using SQLite database");
    Ok(Some(pool))
}

fn sqlite_file_path(url: &str) -> Option<&str> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    (!path.is_empty() && !path.starts_with(":memory:")).then_some(path)
}

async fn create_record_store(pool: Option<SqlitePool>) -> Result<Arc<dyn RecordStore>> {
    match pool {
        Some(pool) => {
            let records = SqliteRecordStore::new(pool);
            records.init_schema().await?;
            Ok(Arc::new(records))
        }
        None => {
            warn!("Using in-process record store; records are lost on restart");
            Ok(Arc::new(InMemoryRecordStore::new()))
        }
    }
}

async fn create_queue(
    config: &AppConfig,
    pool: Option<SqlitePool>,
) -> Result<(Arc<dyn QueuePublisher>, Arc<dyn QueueConsumer>)> {
    let name = config.queue.name.clone();
    let visibility = config.queue.visibility_timeout_secs;

    match (config.queue.backend.as_str(), pool) {
        ("sqlite", Some(pool)) => {
            let queue = Arc::new(SqliteQueue::new(pool, name, visibility));
            queue.init_schema().await?;
            info!(queue = %config.queue.name, "Using SQLite queue");
            let publisher: Arc<dyn QueuePublisher> = queue.clone();
            let consumer: Arc<dyn QueueConsumer> = queue;
            Ok((publisher, consumer))
        }
        (backend, _) => {
            if backend == "sqlite" {
                warn!("SQLite queue needs a SQLite database, falling back to in-process queue");
            }
            let queue = Arc::new(InMemoryQueue::new(name, visibility));
            let publisher: Arc<dyn QueuePublisher> = queue.clone();
            let consumer: Arc<dyn QueueConsumer> = queue;
            Ok((publisher, consumer))
        }
    }
}

fn create_downstream(config: &AppConfig) -> Result<Arc<dyn Downstream>> {
    match config.downstream.mode.as_str() {
        "http" => {
            let timeout = Duration::from_millis(config.dispatch.call_timeout_ms);
            let downstream = HttpDownstream::new(config.downstream.url.clone(), timeout)?;
            Ok(Arc::new(downstream))
        }
        _ => {
            info!(
                min_latency_ms = config.downstream.mock_min_latency_ms,
                max_latency_ms = config.downstream.mock_max_latency_ms,
                failure_rate = config.downstream.mock_failure_rate,
                "Using mock downstream"
            );
            Ok(Arc::new(MockDownstream::from_config(&config.downstream)))
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

fn log_startup_summary(config: &AppConfig, addr: &str) {
    info!("=== Surgegate Startup Summary ===");
    info!("  HTTP: {}", addr);
    info!("  Counter store: {} (prefix {})", config.store.backend, config.store.key_prefix);
    info!("  Queue: {} ({})", config.queue.name, config.queue.backend);
    info!("  Output rate: {} RPS", config.pacer.output_rps);
    info!(
        "  Input limits: normal={} busy={} overloaded={} critical={}",
        config.admission.normal_rps,
        config.admission.busy_rps,
        config.admission.overloaded_rps,
        config.admission.critical_rps
    );
    info!("  Downstream: {}", config.downstream.mode);
    info!("=================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
