//! # parley-server
//!
//! Presence-aware chat relay.
//!
//! This binary provides:
//! - **WebSocket relay** that persists each chat envelope and then delivers
//!   it to every live connection of the recipient
//! - **Presence** broadcasts whenever a connection opens, binds or closes
//! - **Heartbeats** that evict connections which stop answering pings
//! - **REST API** (axum) for health, conversation history and attachment
//!   downloads

mod api;
mod attachments;
mod auth;
mod config;
mod error;
mod heartbeat;
mod hub;
mod presence;
mod registry;
mod router;
mod ws;

use std::sync::Arc;

use parley_store::{Database, SqliteMessageStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::attachments::DiskAttachmentStore;
use crate::auth::JwtVerifier;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::router::Stores;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Environment and tracing (respects RUST_LOG)
    // -----------------------------------------------------------------------
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize collaborators
    // -----------------------------------------------------------------------
    let database = Database::open_at(&config.database_path)?;
    info!(
        path = ?database.path(),
        messages = database.count_messages()?,
        "Opened message store"
    );
    let messages = Arc::new(SqliteMessageStore::new(database));

    let attachments = Arc::new(
        DiskAttachmentStore::new(config.uploads_path.clone(), config.max_attachment_size).await?,
    );

    let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));

    // -----------------------------------------------------------------------
    // 4. Spawn the relay hub
    // -----------------------------------------------------------------------
    let hub = Hub::spawn(
        Stores {
            messages: messages.clone(),
            attachments: attachments.clone(),
        },
        config.heartbeat,
    );

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub,
        messages,
        attachments,
        verifier,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server until shutdown
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
