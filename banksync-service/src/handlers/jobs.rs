//! Scheduled-job trigger handlers.
//!
//! These endpoints are hit by the external time trigger and are protected by
//! the job-token middleware. A trigger that finds the lease taken reports
//! 409 and does no work.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;

use crate::services::recurring::RecurringOutcome;
use crate::services::sync::SyncOutcome;
use crate::AppState;

pub async fn trigger_transaction_sync(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    match state.sync.run(&state.shutdown).await? {
        SyncOutcome::Completed(report) => Ok((StatusCode::OK, Json(json!(report)))),
        SyncOutcome::AlreadyRunning => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running" })),
        )),
    }
}

pub async fn trigger_recurring_check(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let today = Utc::now().date_naive();
    match state.recurring.run(today).await? {
        RecurringOutcome::Completed(report) => Ok((StatusCode::OK, Json(json!(report)))),
        RecurringOutcome::AlreadyRunning => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running" })),
        )),
    }
}
