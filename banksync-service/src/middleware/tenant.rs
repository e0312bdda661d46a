//! Tenant context extractor.
//!
//! Every tenant-scoped endpoint requires an X-Tenant-ID header identifying
//! the owning tenant. The header is set by the gateway after authentication;
//! this service only scopes its queries by it.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

/// Tenant identity extracted from request headers.
#[derive(Debug, Clone, Copy)]
pub struct TenantContext {
    pub tenant_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-Tenant-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing X-Tenant-ID header")))?;

        let tenant_id = Uuid::parse_str(raw)
            .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid X-Tenant-ID header")))?;

        let span = tracing::Span::current();
        span.record("tenant_id", raw);

        Ok(TenantContext { tenant_id })
    }
}
