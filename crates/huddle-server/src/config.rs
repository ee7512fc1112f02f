//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use huddle_hub::HubConfig;
use huddle_shared::constants::{
    COMMAND_BUFFER, DEFAULT_HTTP_PORT, MAX_ATTACHMENT_SIZE, MAX_SUBSCRIPTIONS_PER_CONNECTION,
    OUTBOX_BUFFER, UPLOAD_SWEEP_INTERVAL,
};

/// `DATABASE_PATH` value selecting the in-memory attachment store.
pub const IN_MEMORY: &str = ":memory:";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file holding attachment metadata and chunks.
    /// Env: `DATABASE_PATH`
    /// Default: `./huddle.db`; `:memory:` keeps attachments in process memory.
    pub database_path: PathBuf,

    /// Upload timeout sweep period in seconds.
    /// Env: `UPLOAD_SWEEP_SECS`
    /// Default: `15`
    pub upload_sweep_secs: u64,

    /// Topics a single connection may subscribe to.
    /// Env: `MAX_SUBSCRIPTIONS`
    /// Default: `128`
    pub max_subscriptions: usize,

    /// Largest declared attachment size in bytes.
    /// Env: `MAX_ATTACHMENT_SIZE`
    /// Default: 20 MiB
    pub max_attachment_size: u64,

    /// Capacity of each hub actor's command channel.
    /// Env: `COMMAND_BUFFER`
    /// Default: `64`
    pub command_buffer: usize,

    /// Capacity of each connection's outbound queue.
    /// Env: `OUTBOX_BUFFER`
    /// Default: `256`
    pub outbox_buffer: usize,

    /// Allowed CORS origins. Empty allows any origin.
    /// Env: `CORS_ORIGINS` (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./huddle.db"),
            upload_sweep_secs: UPLOAD_SWEEP_INTERVAL.as_secs(),
            max_subscriptions: MAX_SUBSCRIPTIONS_PER_CONNECTION,
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            command_buffer: COMMAND_BUFFER,
            outbox_buffer: OUTBOX_BUFFER,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = PathBuf::from(path);
            }
        }

        parse_positive(&lookup, "UPLOAD_SWEEP_SECS", &mut config.upload_sweep_secs);
        parse_positive(&lookup, "MAX_SUBSCRIPTIONS", &mut config.max_subscriptions);
        parse_positive(&lookup, "MAX_ATTACHMENT_SIZE", &mut config.max_attachment_size);
        parse_positive(&lookup, "COMMAND_BUFFER", &mut config.command_buffer);
        parse_positive(&lookup, "OUTBOX_BUFFER", &mut config.outbox_buffer);

        if let Some(origins) = lookup("CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Whether attachments are kept in memory instead of SQLite.
    pub fn in_memory_store(&self) -> bool {
        self.database_path == Path::new(IN_MEMORY)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_subscriptions: self.max_subscriptions,
            upload_sweep_interval: Duration::from_secs(self.upload_sweep_secs),
            max_attachment_size: self.max_attachment_size,
            command_buffer: self.command_buffer,
            outbox_buffer: self.outbox_buffer,
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(value = %raw, "Invalid {}, using default", key),
    }
}

/// Like [`parse_into`] but zero is rejected too.
fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr + Default + PartialEq + Copy,
{
    let previous = *slot;
    parse_into(lookup, key, slot);
    if *slot == T::default() {
        tracing::warn!("{} must be greater than zero, using default", key);
        *slot = previous;
    }
}
