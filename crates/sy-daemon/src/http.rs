use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sy_telemetry::health::HealthStatus;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::daemon::DaemonState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/metrics", get(metrics_json))
        .route("/api/alerts", get(alerts))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /metrics -- Prometheus text exposition.
async fn metrics(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    let body = state.metrics.read().await.export_prometheus();
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body)
}

/// GET /api/metrics -- latest value of every series as JSON.
async fn metrics_json(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    Json(state.metrics.read().await.export_json())
}

/// GET /health -- runs the checks now. 503 when unhealthy.
async fn health(State(state): State<Arc<DaemonState>>) -> Response {
    match state.check_health().await {
        Ok(health) => {
            let code = match health.status {
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            };
            (code, Json(health)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /api/stats -- engine snapshot.
async fn stats(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    Json(state.snapshot().await)
}

/// GET /api/alerts -- registered alerts and which are active.
async fn alerts(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    let alerts = state.alerts.lock().await;
    let all: Vec<_> = alerts.alerts().cloned().collect();
    let active: Vec<&str> = alerts.active().map(|a| a.name.as_str()).collect();
    Json(json!({ "alerts": all, "active": active }))
}
