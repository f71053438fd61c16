mod api;
mod app_state;
mod config;
mod core;
mod domain;
mod errors;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::core::client::prometheus::PromClient;
use crate::core::store::TicketStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let tickets = Arc::new(TicketStore::new(config.database_url.clone()));
    tickets
        .connect()
        .await
        .context("initial database connection failed")?;

    let metrics = Arc::new(PromClient::new(config.prometheus_url.clone())?);

    let state = AppState {
        tickets: tickets.clone(),
        metrics,
    };
    let app = routes::app_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "started super mega data gatherer");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tickets.disconnect().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
