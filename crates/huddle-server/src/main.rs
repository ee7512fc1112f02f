//! # huddle-server
//!
//! Real-time chat hub server.
//!
//! This binary provides:
//! - **WebSocket endpoint** (`/ws`) for presence, topic subscriptions and
//!   1:1 call signaling
//! - **Attachment API** for registering, uploading (4 MiB chunks),
//!   downloading and deleting message attachments
//! - **Health check** reporting the number of live connections
//!
//! Attachments are stored in SQLite unless `DATABASE_PATH=:memory:`.

mod api;
mod config;
mod error;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use huddle_hub::Hub;
use huddle_store::{Database, MemoryStore};

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,huddle_server=debug,huddle_hub=debug")
            }),
        )
        .init();

    info!("Starting huddle server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the attachment store and start the hub
    // -----------------------------------------------------------------------
    let hub = if config.in_memory_store() {
        info!("Using in-memory attachment store");
        Hub::start(config.hub_config(), MemoryStore::new())
    } else {
        let db = Database::open_at(&config.database_path)?;
        info!(path = %config.database_path.display(), "Opened attachment database");
        Hub::start(config.hub_config(), db)
    };

    let app_state = AppState {
        hub,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
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
