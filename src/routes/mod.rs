use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::app_state::AppState;

pub mod health;
pub mod scan;

/// API routes for the scan coordinator. Uploads up to `max_upload_bytes` are
/// accepted; anything the preprocessor would downscale must fit here.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/scans", axum::routing::post(scan::submit_scan))
        .route(
            "/api/v1/scans/current",
            get(scan::current_scan).delete(scan::abandon_scan),
        )
        .route("/api/v1/scans/events", get(scan::scan_events))
        // Multipart has its own 2 MB default, below the images worth downscaling
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
