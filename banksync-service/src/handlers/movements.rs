//! Bank movement handlers: listing and manual reconciliation actions.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::TenantContext;
use crate::models::{BankMovement, MovementStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct MovementsQuery {
    pub status: Option<String>,
}

pub async fn list_movements(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<MovementsQuery>,
) -> Result<Json<Vec<BankMovement>>, AppError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => {
            let status = MovementStatus::parse(raw);
            // parse() folds unknown values into Unmatched; a filter must not.
            if status.as_str() != raw {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Unknown movement status '{}'",
                    raw
                )));
            }
            Some(status)
        }
    };

    let movements = state.db.list_movements(tenant.tenant_id, status).await?;
    Ok(Json(movements))
}

/// Confirm the suggested obligation link on a movement.
pub async fn confirm_movement(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(movement_id): Path<Uuid>,
) -> Result<Json<BankMovement>, AppError> {
    let movement = state
        .matcher
        .confirm_suggestion(tenant.tenant_id, movement_id)
        .await?;
    Ok(Json(movement))
}

/// Reject the suggested obligation link on a movement.
pub async fn reject_movement(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(movement_id): Path<Uuid>,
) -> Result<Json<BankMovement>, AppError> {
    let movement = state
        .matcher
        .reject_suggestion(tenant.tenant_id, movement_id)
        .await?;
    Ok(Json(movement))
}
