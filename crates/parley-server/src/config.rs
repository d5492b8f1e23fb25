//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development. A `.env` file in the working
//! directory is honoured (loaded in `main`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_HTTP_PORT, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_ATTACHMENT_SIZE,
};

use crate::heartbeat::HeartbeatConfig;

/// Secret used when `JWT_SECRET` is unset. Only suitable for local development.
const DEV_JWT_SECRET: &str = "parley-dev-secret";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8000`
    pub http_addr: SocketAddr,

    /// SQLite database holding persisted messages.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Directory where attachments are written.
    /// Env: `UPLOADS_PATH`
    /// Default: `./uploads`
    pub uploads_path: PathBuf,

    /// HS256 secret shared with the identity service that mints session tokens.
    /// Env: `JWT_SECRET`
    pub jwt_secret: String,

    /// Env: `HEARTBEAT_INTERVAL_MS`, `HEARTBEAT_TIMEOUT_MS`
    /// Default: 5000 / 1000
    pub heartbeat: HeartbeatConfig,

    /// Largest decoded attachment accepted, in bytes.
    /// Env: `MAX_ATTACHMENT_SIZE`
    /// Default: 50 MiB
    pub max_attachment_size: usize,

    /// Allowed CORS origin. When unset the request origin is mirrored, which
    /// is what credentialed browser clients need.
    /// Env: `CORS_ORIGIN`
    pub cors_origin: Option<String>,
}

// Keep the secret out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("uploads_path", &self.uploads_path)
            .field("jwt_secret", &"<redacted>")
            .field("heartbeat", &self.heartbeat)
            .field("max_attachment_size", &self.max_attachment_size)
            .field("cors_origin", &self.cors_origin)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            uploads_path: PathBuf::from("./uploads"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
                timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            },
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            cors_origin: None,
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

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("UPLOADS_PATH") {
            config.uploads_path = PathBuf::from(path);
        }

        match lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("JWT_SECRET not set, using development secret"),
        }

        if let Some(ms) = parse_positive(&lookup, "HEARTBEAT_INTERVAL_MS") {
            config.heartbeat.interval = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive(&lookup, "HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat.timeout = Duration::from_millis(ms);
        }

        if let Some(size) = parse_positive(&lookup, "MAX_ATTACHMENT_SIZE") {
            config.max_attachment_size = size as usize;
        }

        if let Some(origin) = lookup("CORS_ORIGIN").filter(|s| !s.is_empty()) {
            config.cors_origin = Some(origin);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid positive integer, using default");
            None
        }
    }
}
