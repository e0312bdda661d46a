//! HTTP handlers for banksync-service.

pub mod connections;
pub mod jobs;
pub mod movements;

use crate::services::metrics::get_metrics;
use crate::AppState;
use axum::extract::State;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "banksync-service" })),
    )
}

/// Readiness gate: the service is ready once the database answers.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        ),
    }
}

pub async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, get_metrics())
}
