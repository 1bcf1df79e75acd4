/**
 * HTTP SCRAPE ENDPOINT
 *
 * ROLE:
 * Exposes the metric registry to Prometheus and a small health view for humans.
 *
 * ROUTES:
 * - GET /metrics        Prometheus text exposition of the owned registry
 * - GET /health         liveness check, always "ok"
 * - GET /system/health  JSON: MQTT status, reconnect count, idle time, uptime
 *
 * Scrapes only read the prometheus::Registry, never the processing loop state.
 */

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

use crate::health::{ExporterHealth, HealthTracker};
use crate::models::Device;
use crate::watchdog::ConnectionState;

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub health_tracker: HealthTracker,
    pub device: Device,
    pub connection: Arc<ConnectionState>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/metrics", get(get_metrics))
        .with_state(app_state)
}

// GET /metrics
async fn get_metrics(State(app): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let families = app.registry.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<ExporterHealth> {
    Json(app.health_tracker.get_health(&app.device, &app.connection))
}
