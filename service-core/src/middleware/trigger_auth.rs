//! Shared-secret authentication for scheduled-trigger endpoints.
//!
//! Scheduled jobs (transaction sync, recurring-obligation check) are invoked
//! by an external time trigger, not by an end user. Those endpoints are
//! guarded by a static job token carried in the `X-Job-Token` header,
//! distinct from tenant headers used on user-facing routes.

use crate::error::AppError;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use secrecy::{ExposeSecret, Secret};
use subtle::ConstantTimeEq;

pub const JOB_TOKEN_HEADER: &str = "X-Job-Token";

#[derive(Clone, Debug)]
pub struct TriggerAuthConfig {
    /// Expected token value. When empty, all trigger requests are rejected.
    pub token: Secret<String>,
    /// Path prefixes this middleware protects; everything else passes through.
    pub protected_prefixes: Vec<String>,
}

pub async fn trigger_auth_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<TriggerAuthConfig> + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();
    let path = req.uri().path();

    if !config
        .protected_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
    {
        return Ok(next.run(req).await);
    }

    let presented = get_header(req.headers(), JOB_TOKEN_HEADER)?;
    let expected = config.token.expose_secret();

    if expected.is_empty() || !token_matches(expected, &presented) {
        return Err(AppError::AuthError(anyhow::anyhow!("Invalid job token")));
    }

    Ok(next.run(req).await)
}

/// Constant-time comparison so the token cannot be probed byte by byte.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn get_header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid header format: {}", key)))
}

#[cfg(test)]
mod tests {
    use super::token_matches;

    #[test]
    fn matching_tokens_pass() {
        assert!(token_matches("s3cret-job-token", "s3cret-job-token"));
    }

    #[test]
    fn mismatched_tokens_fail() {
        assert!(!token_matches("s3cret-job-token", "s3cret-job-tokem"));
        assert!(!token_matches("s3cret-job-token", ""));
        assert!(!token_matches("s3cret-job-token", "s3cret"));
    }
}
