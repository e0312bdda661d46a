pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::middleware::{
    metrics::metrics_middleware,
    tracing::request_id_middleware,
    trigger_auth::{trigger_auth_middleware, TriggerAuthConfig},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use config::BankSyncConfig;
use services::{
    AggregatorClient, ConnectionManager, Database, Matcher, RecurringScheduler,
    TransactionSyncService,
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub aggregator: Arc<AggregatorClient>,
    pub connections: ConnectionManager,
    pub matcher: Matcher,
    pub sync: TransactionSyncService,
    pub recurring: RecurringScheduler,
    pub trigger_auth: TriggerAuthConfig,
    /// Cancelled on shutdown; the sync loop checks it between connections.
    pub shutdown: CancellationToken,
}

impl AsRef<TriggerAuthConfig> for AppState {
    fn as_ref(&self) -> &TriggerAuthConfig {
        &self.trigger_auth
    }
}

pub struct Application {
    port: u16,
    host: String,
    router: Router,
    shutdown: CancellationToken,
}

impl Application {
    pub async fn build(config: BankSyncConfig) -> anyhow::Result<Self> {
        services::metrics::init_metrics();

        let db = Arc::new(
            Database::new(
                config.database.url.expose_secret(),
                config.database.max_connections,
                config.database.min_connections,
            )
            .await?,
        );
        db.run_migrations().await?;

        let aggregator = Arc::new(AggregatorClient::new(config.aggregator.clone())?);
        if aggregator.is_configured() {
            tracing::info!("Aggregator client initialized");
        } else {
            tracing::warn!(
                "Aggregator credentials not configured - bank connectivity will be limited"
            );
        }

        let connections = ConnectionManager::new(
            db.clone(),
            aggregator.clone(),
            config.aggregator.redirect_url.clone(),
        );
        let matcher = Matcher::new(db.clone());
        let sync = TransactionSyncService::new(
            db.clone(),
            aggregator.clone(),
            matcher.clone(),
            config.jobs.lease_ttl_secs,
        );
        let recurring = RecurringScheduler::new(db.clone(), config.jobs.lease_ttl_secs);

        let trigger_auth = TriggerAuthConfig {
            token: config.jobs.trigger_token.clone(),
            protected_prefixes: vec!["/jobs/".to_string()],
        };

        let shutdown = CancellationToken::new();

        let state = AppState {
            db,
            aggregator,
            connections,
            matcher,
            sync,
            recurring,
            trigger_auth,
            shutdown: shutdown.clone(),
        };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics))
            // Connection lifecycle (tenant-scoped, except the redirect target)
            .route("/institutions", get(handlers::connections::list_institutions))
            .route(
                "/connections",
                post(handlers::connections::start_connection)
                    .get(handlers::connections::list_connections),
            )
            .route(
                "/connections/callback",
                get(handlers::connections::consent_callback),
            )
            // Movements and manual reconciliation
            .route("/movements", get(handlers::movements::list_movements))
            .route(
                "/movements/:id/confirm",
                post(handlers::movements::confirm_movement),
            )
            .route(
                "/movements/:id/reject",
                post(handlers::movements::reject_movement),
            )
            // Scheduled-job triggers (job-token protected)
            .route(
                "/jobs/transaction-sync",
                post(handlers::jobs::trigger_transaction_sync),
            )
            .route(
                "/jobs/recurring-check",
                post(handlers::jobs::trigger_recurring_check),
            )
            .layer(from_fn_with_state(
                state.clone(),
                trigger_auth_middleware::<AppState>,
            ))
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }),
            )
            .with_state(state);

        Ok(Self {
            port: config.server.port,
            host: config.server.host,
            router,
            shutdown,
        })
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = self.shutdown;

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::error!("Failed to install shutdown signal handler");
                }
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            })
            .await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
