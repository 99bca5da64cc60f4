//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_CACHE_TTL_SECS, DEFAULT_HTTP_PORT, DEFAULT_MAILBOX_CAPACITY,
    DEFAULT_OUTBOUND_QUEUE_CAPACITY, MESSAGES_FILE, USERS_FILE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Directory holding `users.json` and `messages.json`.
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Lifetime of a read cache entry after its last write.
    /// Env: `CACHE_TTL_SECS`
    /// Default: 300 seconds
    pub cache_ttl: Duration,

    /// Inbound events a connection may queue before its reader blocks.
    /// Env: `MAILBOX_CAPACITY`
    /// Default: 10
    pub mailbox_capacity: usize,

    /// Outbound frames queued per connection before live pushes are dropped.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    /// Default: 64
    pub outbound_queue_capacity: usize,

    /// Webhook endpoints that receive every new notification.
    /// Env: `WEBHOOK_URLS` (comma separated)
    /// Default: none
    pub webhook_urls: Vec<String>,

    /// Timeout for a single webhook POST.
    /// Env: `WEBHOOK_TIMEOUT_MS`
    /// Default: 5000
    pub webhook_timeout: Duration,

    /// Maximum HTTP request body size in bytes (64 MiB, room for a 50 MiB
    /// video attachment after base64 expansion).
    /// Env: `MAX_BODY_SIZE`
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            data_dir: PathBuf::from("./data"),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            webhook_urls: Vec::new(),
            webhook_timeout: Duration::from_millis(5000),
            max_body_size: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(secs) = parse_positive(&lookup, "CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs as u64);
        }

        if let Some(n) = parse_positive(&lookup, "MAILBOX_CAPACITY") {
            config.mailbox_capacity = n;
        }

        if let Some(n) = parse_positive(&lookup, "OUTBOUND_QUEUE_CAPACITY") {
            config.outbound_queue_capacity = n;
        }

        if let Some(urls) = lookup("WEBHOOK_URLS") {
            config.webhook_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(ms) = parse_positive(&lookup, "WEBHOOK_TIMEOUT_MS") {
            config.webhook_timeout = Duration::from_millis(ms as u64);
        }

        if let Some(n) = parse_positive(&lookup, "MAX_BODY_SIZE") {
            config.max_body_size = n;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join(USERS_FILE)
    }

    pub fn messages_path(&self) -> PathBuf {
        self.data_dir.join(MESSAGES_FILE)
    }
}

/// Parse a non-zero count, warning about and ignoring anything else.
fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
