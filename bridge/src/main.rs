//! BoardMail web server.
//!
//! Serves the inbound mail webhooks, the board webhook, the relay's delivery
//! callbacks and the address API from one process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use boardmail::billing::HttpBilling;
use boardmail::board::TrelloClient;
use boardmail::relay::MailgunClient;
use boardmail::{web, AppState, Config, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        base_domain = %config.base_domain,
        database = %config.database_path.display(),
        cloudflare_auth_configured = config.cloudflare_auth_token.is_some(),
        mailgun_signing_configured = config.mailgun_signing_key.is_some(),
        api_enabled = config.api_token.is_some(),
        billing_configured = config.billing_api_url.is_some(),
        "config_loaded"
    );
    if config.trello_bot_id.is_empty() {
        tracing::warn!("trello_bot_id_missing");
    }

    let store = Store::open(&config.database_path).context("Failed to open database")?;
    let board = TrelloClient::from_config(&config).context("Failed to build board client")?;
    let relay = MailgunClient::from_config(&config).context("Failed to build relay client")?;
    let billing = HttpBilling::from_config(&config).context("Failed to build billing client")?;

    let port = config.port;
    let state = AppState::new(
        config,
        store,
        Arc::new(board),
        Arc::new(relay),
        Arc::new(billing),
    );
    let app = web::router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
