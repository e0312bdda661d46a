//! banksync-service entry point.

use banksync_service::config::BankSyncConfig;
use banksync_service::Application;
use service_core::observability::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BankSyncConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    init_logging(&config.service_name, &config.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = %config.server.port,
        aggregator_base_url = %config.aggregator.base_url,
        db_max_connections = %config.database.max_connections,
        "Starting banksync-service"
    );

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        e
    })?;

    application.run_until_stopped().await?;

    Ok(())
}
