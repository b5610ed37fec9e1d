use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use scan_sync::app_state::AppState;
use scan_sync::config::{AppConfig, StoreBackend};
use scan_sync::routes;
use scan_sync::services::{
    coordinator::Coordinator, memory_store::MemoryRecordStore, redis_store::RedisRecordStore,
    store::RecordStore,
};

const SHUTDOWN_ATTEMPTS: u32 = 3;
const SHUTDOWN_RETRY_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing scan-sync");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("scan_jobs_submitted", "Total scans submitted");
    metrics::describe_counter!("scan_jobs_completed", "Total scans with all analyzer results");
    metrics::describe_counter!("scan_jobs_failed", "Total scans failed by an analyzer");
    metrics::describe_counter!(
        "scan_jobs_abandoned",
        "Total scans released before reaching a terminal status"
    );
    metrics::describe_histogram!(
        "scan_resolution_seconds",
        "Time from submission until all analyzer results arrived"
    );
    metrics::describe_histogram!(
        "scan_preprocess_seconds",
        "Time spent downscaling oversized images"
    );

    // Initialize the shared record store
    let store: Arc<dyn RecordStore> = match config.store_backend {
        StoreBackend::Redis => {
            tracing::info!("Connecting to Redis record store");
            Arc::new(RedisRecordStore::new(&config.redis_url).expect("Failed to initialize Redis store"))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory record store; scans are not shared");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let coordinator = Coordinator::spawn(store.clone(), config.preprocessor(), config.event_capacity);
    let state = AppState::new(coordinator.clone(), store);

    let app = routes::router(state, config.max_upload_bytes)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await
        .expect("Server error");

    tracing::info!("scan-sync stopped");
}

async fn shutdown_signal(coordinator: Coordinator) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");

    // Never leave an orphaned record or an open subscription behind
    for attempt in 1..=SHUTDOWN_ATTEMPTS {
        match coordinator.shutdown().await {
            Ok(()) => return,
            Err(e) if attempt < SHUTDOWN_ATTEMPTS => {
                tracing::warn!(error = %e, attempt, "Failed to release active scan, retrying");
                tokio::time::sleep(SHUTDOWN_RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Giving up on releasing active scan");
                // Stop anyway so open event streams end and the server can drain
                if let Err(e) = coordinator.stop().await {
                    tracing::error!(error = %e, "Coordinator stopped with scan left in store");
                }
            }
        }
    }
}
