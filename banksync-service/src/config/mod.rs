//! Configuration module for banksync-service.

use secrecy::Secret;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct BankSyncConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub aggregator: AggregatorConfig,
    pub jobs: JobConfig,
    pub service_name: String,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub base_url: String,
    pub secret_id: String,
    pub secret_key: Secret<String>,
    /// Where the aggregator sends the user back after the consent flow.
    pub redirect_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Shared secret expected in X-Job-Token on scheduled-trigger endpoints.
    pub trigger_token: Secret<String>,
    pub lease_ttl_secs: i64,
}

impl BankSyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let host = env::var("BANKSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("BANKSYNC_PORT")
            .unwrap_or_else(|_| "3007".to_string())
            .parse()
            .map_err(|_| AppError::ConfigError(anyhow::anyhow!("Invalid BANKSYNC_PORT")))?;

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required")))?;

        let aggregator_base_url = env::var("AGGREGATOR_BASE_URL")
            .unwrap_or_else(|_| "https://bankdata.example.com/api/v2".to_string());
        let aggregator_secret_id = env::var("AGGREGATOR_SECRET_ID").unwrap_or_default();
        let aggregator_secret_key = env::var("AGGREGATOR_SECRET_KEY").unwrap_or_default();
        let redirect_url = env::var("AGGREGATOR_REDIRECT_URL")
            .unwrap_or_else(|_| "http://localhost:3007/connections/callback".to_string());

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(database_url),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            aggregator: AggregatorConfig {
                base_url: aggregator_base_url,
                secret_id: aggregator_secret_id,
                secret_key: Secret::new(aggregator_secret_key),
                redirect_url,
                request_timeout_secs: env::var("AGGREGATOR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
            jobs: JobConfig {
                trigger_token: Secret::new(env::var("JOB_TRIGGER_TOKEN").unwrap_or_default()),
                lease_ttl_secs: env::var("JOB_LEASE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            },
            service_name: "banksync-service".to_string(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
