//! logistics-server: serves the NCM webhook against the local order database.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use merchant_logistics::config::{self, AppConfig};
use merchant_logistics::{db, logging, webhook, CourierClient, LogisticsSyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    // Dropping the guard flushes the file writer.
    let _log_guard = logging::init_tracing(&config.log_dir);
    info!("Starting logistics-server v{}", env!("CARGO_PKG_VERSION"));

    let db = db::init(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;

    let api_key = {
        let conn = db.lock()?;
        config::resolve_courier_api_key(config.courier_api_key.as_deref(), &conn)?
    };
    let courier = CourierClient::new(&config.courier_config(api_key))
        .context("building courier client")?;

    let engine = LogisticsSyncEngine::new(Arc::new(db), Arc::new(courier))
        .with_defaults(&config.default_from_branch, &config.default_delivery_type);
    let app = webhook::router(Arc::new(engine));

    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, path = webhook::WEBHOOK_PATH, "Webhook listener ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("logistics-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
