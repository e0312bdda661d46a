//! Connection lifecycle handlers.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::middleware::TenantContext;
use crate::models::BankConnection;
use crate::services::aggregator::Institution;
use crate::services::connections::CompletionOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InstitutionsQuery {
    pub country: String,
}

/// Passthrough institution directory, filtered by country.
pub async fn list_institutions(
    State(state): State<AppState>,
    Query(query): Query<InstitutionsQuery>,
) -> Result<Json<Vec<Institution>>, AppError> {
    if query.country.len() != 2 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "country must be a two-letter ISO code"
        )));
    }

    let institutions = state
        .aggregator
        .list_institutions(&query.country)
        .await
        .map_err(|e| AppError::BadGateway(e.to_string()))?;

    Ok(Json(institutions))
}

#[derive(Debug, Deserialize)]
pub struct StartConnectionRequest {
    pub institution_id: String,
    pub institution_name: String,
}

#[derive(Debug, Serialize)]
pub struct StartConnectionResponse {
    pub connection: BankConnection,
    /// Hosted-consent URL the end user must visit to authorize access.
    pub consent_link: String,
}

pub async fn start_connection(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<StartConnectionRequest>,
) -> Result<(StatusCode, Json<StartConnectionResponse>), AppError> {
    if payload.institution_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "institution_id is required"
        )));
    }

    let (connection, consent_link) = state
        .connections
        .start_connection(
            tenant.tenant_id,
            &payload.institution_id,
            &payload.institution_name,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartConnectionResponse {
            connection,
            consent_link,
        }),
    ))
}

pub async fn list_connections(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Vec<BankConnection>>, AppError> {
    let connections = state.db.list_connections(tenant.tenant_id).await?;
    Ok(Json(connections))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Requisition id echoed back by the aggregator redirect.
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub result: &'static str,
    pub connection: BankConnection,
}

/// Aggregator redirect target after the user finishes (or abandons) the
/// consent flow. Safe to hit repeatedly; an already-active connection is
/// reported as such.
pub async fn consent_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, AppError> {
    if query.reference.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "ref query parameter is required"
        )));
    }

    let outcome = state.connections.complete_connection(&query.reference).await?;

    let (result, connection) = match outcome {
        CompletionOutcome::Activated(c) => ("activated", c),
        CompletionOutcome::AlreadyActive(c) => ("already_active", c),
        CompletionOutcome::StillPending(c) => ("pending", c),
        CompletionOutcome::Rejected(c) => ("rejected", c),
        CompletionOutcome::Expired(c) => ("expired", c),
    };

    Ok(Json(CallbackResponse { result, connection }))
}
