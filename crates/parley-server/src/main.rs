//! # parley-server
//!
//! Real-time chat server.
//!
//! This binary provides:
//! - **WebSocket endpoint** carrying JSON chat messages, with one bounded
//!   mailbox and one serialized writer per connection
//! - **REST API** (axum) for accounts, messages, groups, presence and
//!   notifications
//! - **JSON document storage** for users and messages, rewritten atomically
//!   on every change
//! - **Webhook fan-out** of new notifications, best effort

mod api;
mod auth;
mod cache;
mod config;
mod dispatcher;
mod error;
mod notifications;
mod presence;
mod registry;
mod webhook;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::webhook::HttpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,parley_server=debug,parley_store=debug")
            }),
        )
        .init();

    info!("Starting Parley chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let transport = Arc::new(HttpTransport::new(config.webhook_timeout)?);
    let http_addr = config.http_addr;
    let app_state = AppState::build(config, transport).await?;

    info!(
        messages = app_state.messages.count().await,
        webhooks = app_state.notifications.webhooks().await.len(),
        "Storage loaded"
    );

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
