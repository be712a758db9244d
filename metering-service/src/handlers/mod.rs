//! HTTP handlers for metering-service.

pub mod billing;
pub mod webhook;

use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness probe; reports unhealthy when the usage store is unreachable.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.usage_store.health_check().await {
        Ok(()) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "metering-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - usage store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "metering-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness probe; not ready once the tracker has started shutting down.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.tracker.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.usage_store.health_check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
