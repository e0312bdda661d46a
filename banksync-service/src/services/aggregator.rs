//! Open-Banking aggregator client.
//!
//! Thin protocol client for the aggregator's REST API: token acquisition,
//! institution lookup, requisition create/read, and transaction retrieval.
//! Holds no state beyond the short-lived access token; retry policy lives
//! with the callers (the next scheduled run is the retry).

use crate::config::AggregatorConfig;
use crate::services::metrics::record_aggregator_request;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Safety margin subtracted from the upstream-stated token validity so a
/// token is never presented moments before it lapses.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// Non-success HTTP response, carrying the upstream status and raw body.
    #[error("Aggregator error: {status} - {body}")]
    Upstream { status: u16, body: String },

    /// Network-level failure, including the bounded request timeout.
    #[error("Aggregator request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode aggregator response: {0}")]
    Decode(#[from] serde_json::Error),
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    secret_id: &'a str,
    secret_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    /// Validity of the access token in seconds.
    access_expires: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Institution {
    pub id: String,
    pub name: String,
    pub bic: Option<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    pub logo: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequisitionRequest<'a> {
    institution_id: &'a str,
    redirect: &'a str,
    reference: &'a str,
}

/// The aggregator's object representing one consent flow.
#[derive(Debug, Clone, Deserialize)]
pub struct Requisition {
    pub id: String,
    /// Two-letter lifecycle code, e.g. "CR" created, "LN" linked,
    /// "RJ" rejected, "EX" expired.
    pub status: String,
    pub institution_id: String,
    pub reference: Option<String>,
    /// Hosted-consent URL the end user is redirected to.
    pub link: Option<String>,
    /// Account identifiers, populated once consent is granted.
    #[serde(default)]
    pub accounts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    transactions: TransactionsEnvelope,
}

#[derive(Debug, Deserialize)]
struct TransactionsEnvelope {
    #[serde(default)]
    booked: Vec<RawTransaction>,
    // Pending entries are ignored: they carry no stable transaction id, so
    // they cannot participate in idempotent ingestion.
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub transaction_id: Option<String>,
    pub internal_transaction_id: Option<String>,
    pub booking_date: Option<String>,
    pub value_date: Option<String>,
    pub transaction_amount: TransactionAmount,
    pub creditor_name: Option<String>,
    pub debtor_name: Option<String>,
    pub remittance_information_unstructured: Option<String>,
    pub remittance_information_structured: Option<String>,
    pub additional_information: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAmount {
    /// Decimal amount as a string, e.g. "-120.00".
    pub amount: String,
    pub currency: String,
}

// ============================================================================
// Token cache
// ============================================================================

#[derive(Debug, Clone)]
struct CachedToken {
    access: String,
    expires_utc: DateTime<Utc>,
}

/// Explicit, injectable access-token cache. One cache per client instance,
/// so multiple credentials can coexist; expiry checks take `now` as an
/// argument so tests can use a fixed clock.
#[derive(Clone, Default)]
pub struct TokenCache {
    inner: Arc<RwLock<Option<CachedToken>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token if it is still valid at `now`.
    pub fn valid_token(&self, now: DateTime<Utc>) -> Option<String> {
        let guard = self.inner.read().ok()?;
        guard.as_ref().and_then(|t| {
            if t.expires_utc - ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECS) > now {
                Some(t.access.clone())
            } else {
                None
            }
        })
    }

    pub fn store(&self, access: String, now: DateTime<Utc>, expires_in_secs: i64) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(CachedToken {
                access,
                expires_utc: now + ChronoDuration::seconds(expires_in_secs),
            });
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct AggregatorClient {
    client: Client,
    config: AggregatorConfig,
    token_cache: TokenCache,
}

impl AggregatorClient {
    /// Create a new aggregator client with a bounded request timeout.
    pub fn new(config: AggregatorConfig) -> Result<Self, AggregatorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            token_cache: TokenCache::new(),
        })
    }

    /// Check if aggregator credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.secret_id.is_empty() && !self.config.secret_key.expose_secret().is_empty()
    }

    /// List institutions available in a country.
    pub async fn list_institutions(
        &self,
        country_code: &str,
    ) -> Result<Vec<Institution>, AggregatorError> {
        let url = format!(
            "{}/institutions/?country={}",
            self.config.base_url, country_code
        );
        self.get_json("institutions", &url).await
    }

    /// Create a requisition (one consent flow) for an institution.
    ///
    /// `reference` must be unique; it correlates the callback redirect with
    /// the connection record created alongside the requisition.
    pub async fn create_requisition(
        &self,
        institution_id: &str,
        redirect_url: &str,
        reference: &str,
    ) -> Result<Requisition, AggregatorError> {
        let url = format!("{}/requisitions/", self.config.base_url);
        let request = CreateRequisitionRequest {
            institution_id,
            redirect: redirect_url,
            reference,
        };
        let requisition: Requisition = self.post_json("create_requisition", &url, &request).await?;

        tracing::info!(
            requisition_id = %requisition.id,
            institution_id = %institution_id,
            "Requisition created"
        );

        Ok(requisition)
    }

    /// Fetch the current status of a requisition.
    pub async fn get_requisition(
        &self,
        requisition_id: &str,
    ) -> Result<Requisition, AggregatorError> {
        let url = format!("{}/requisitions/{}/", self.config.base_url, requisition_id);
        self.get_json("get_requisition", &url).await
    }

    /// List booked transactions for a linked account.
    pub async fn list_transactions(
        &self,
        account_id: &str,
    ) -> Result<Vec<RawTransaction>, AggregatorError> {
        let url = format!(
            "{}/accounts/{}/transactions/",
            self.config.base_url, account_id
        );
        let response: TransactionsResponse = self.get_json("list_transactions", &url).await?;
        Ok(response.transactions.booked)
    }

    /// Return a valid access token, acquiring a fresh one when the cached
    /// token is absent or expired.
    async fn bearer_token(&self) -> Result<String, AggregatorError> {
        if let Some(token) = self.token_cache.valid_token(Utc::now()) {
            return Ok(token);
        }
        self.acquire_token().await
    }

    /// Exchange the client credentials for an access token. Failure here is
    /// fatal for the calling operation; there are no partial credentials.
    async fn acquire_token(&self) -> Result<String, AggregatorError> {
        let url = format!("{}/token/new/", self.config.base_url);
        let request = TokenRequest {
            secret_id: &self.config.secret_id,
            secret_key: self.config.secret_key.expose_secret(),
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            record_aggregator_request("token", "error");
            tracing::error!(status = %status, "Aggregator token acquisition failed");
            return Err(AggregatorError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        self.token_cache
            .store(token.access.clone(), Utc::now(), token.access_expires);
        record_aggregator_request("token", "success");
        tracing::debug!(expires_in = token.access_expires, "Access token refreshed");

        Ok(token.access)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        url: &str,
    ) -> Result<T, AggregatorError> {
        let token = self.bearer_token().await?;
        let response = self.client.get(url).bearer_auth(&token).send().await?;

        // A 401 means the cached token lapsed server-side; refresh once and
        // replay the request.
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            self.token_cache.invalidate();
            let token = self.acquire_token().await?;
            self.client.get(url).bearer_auth(&token).send().await?
        } else {
            response
        };

        self.decode_response(endpoint, response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        url: &str,
        body: &B,
    ) -> Result<T, AggregatorError> {
        let token = self.bearer_token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            self.token_cache.invalidate();
            let token = self.acquire_token().await?;
            self.client
                .post(url)
                .bearer_auth(&token)
                .json(body)
                .send()
                .await?
        } else {
            response
        };

        self.decode_response(endpoint, response).await
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T, AggregatorError> {
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(endpoint = %endpoint, status = %status, "Aggregator response");

        if status.is_success() {
            record_aggregator_request(endpoint, "success");
            Ok(serde_json::from_str(&body)?)
        } else {
            record_aggregator_request(endpoint, "error");
            tracing::error!(
                endpoint = %endpoint,
                status = %status,
                body = %body,
                "Aggregator request failed"
            );
            Err(AggregatorError::Upstream {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 10, hour, minute, 0).unwrap()
    }

    #[test]
    fn empty_cache_yields_no_token() {
        let cache = TokenCache::new();
        assert_eq!(cache.valid_token(at(10, 0)), None);
    }

    #[test]
    fn cached_token_is_returned_within_validity() {
        let cache = TokenCache::new();
        cache.store("tok".to_string(), at(10, 0), 3600);
        assert_eq!(cache.valid_token(at(10, 30)), Some("tok".to_string()));
    }

    #[test]
    fn token_expires_after_validity_window() {
        let cache = TokenCache::new();
        cache.store("tok".to_string(), at(10, 0), 3600);
        assert_eq!(cache.valid_token(at(11, 1)), None);
    }

    #[test]
    fn token_expires_within_safety_margin() {
        let cache = TokenCache::new();
        cache.store("tok".to_string(), at(10, 0), 3600);
        // 59m30s in: the remaining 30s is inside the 60s margin.
        let almost = at(10, 59) + ChronoDuration::seconds(30);
        assert_eq!(cache.valid_token(almost), None);
    }

    #[test]
    fn invalidate_clears_token() {
        let cache = TokenCache::new();
        cache.store("tok".to_string(), at(10, 0), 3600);
        cache.invalidate();
        assert_eq!(cache.valid_token(at(10, 1)), None);
    }

    #[test]
    fn raw_transaction_decodes_camel_case_fields() {
        let json = r#"{
            "transactionId": "tx-1",
            "bookingDate": "2024-08-01",
            "transactionAmount": { "amount": "-42.50", "currency": "EUR" },
            "creditorName": "Hosting Provider",
            "remittanceInformationUnstructured": "Monthly hosting"
        }"#;
        let raw: RawTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(raw.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(raw.transaction_amount.amount, "-42.50");
        assert_eq!(raw.creditor_name.as_deref(), Some("Hosting Provider"));
    }
}
