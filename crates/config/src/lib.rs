//! Configuration loading, validation, and management for tmhub.
//!
//! Loads configuration from `tmhub.toml` with environment variable
//! overrides (`TMHUB_*`). Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    ReadError { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    ParseError { reason: String },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// The root configuration structure.
///
/// Maps directly to `tmhub.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Bearer token verification
    #[serde(default)]
    pub auth: AuthConfig,

    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Per-user API rate limits (defaults; per-user quota rows override)
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Outbound webhook delivery
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Collaborative session tuning
    #[serde(default)]
    pub collab: CollabConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used when building callback URLs
    /// handed to add-on services. Falls back to host:port.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Origins allowed by CORS. Empty = same-origin only.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Request body cap in bytes.
    #[serde(default = "default_body_limit")]
    pub max_body_bytes: usize,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the authentication service.
    #[serde(default)]
    pub jwt_secret: String,

    /// Accepted clock skew when checking `exp`, in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path, or ":memory:" for tests.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_api_minute")]
    pub api_requests_per_minute: u32,

    #[serde(default = "default_api_hour")]
    pub api_requests_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Size of the delivery worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-attempt HTTP timeout.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,

    /// Capacity of the shared delivery queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabConfig {
    /// Per-participant outbound frame buffer; overflow detaches the
    /// participant.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// WebSocket ping cadence.
    #[serde(default = "default_ping_secs")]
    pub ping_interval_secs: u64,

    /// Missed pongs before the socket is considered dead.
    #[serde(default = "default_missed_pongs")]
    pub max_missed_pongs: u32,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_leeway() -> u64 {
    30
}
fn default_db_path() -> String {
    "tmhub.db".into()
}
fn default_db_connections() -> u32 {
    8
}
fn default_api_minute() -> u32 {
    120
}
fn default_api_hour() -> u32 {
    3600
}
fn default_workers() -> usize {
    4
}
fn default_delivery_timeout() -> u64 {
    30
}
fn default_queue_depth() -> usize {
    1024
}
fn default_send_buffer() -> usize {
    64
}
fn default_ping_secs() -> u64 {
    30
}
fn default_missed_pongs() -> u32 {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            allowed_origins: Vec::new(),
            max_body_bytes: default_body_limit(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: default_leeway(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_db_connections(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            api_requests_per_minute: default_api_minute(),
            api_requests_per_hour: default_api_hour(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: default_delivery_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            send_buffer: default_send_buffer(),
            ping_interval_secs: default_ping_secs(),
            max_missed_pongs: default_missed_pongs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
            limits: LimitsConfig::default(),
            delivery: DeliveryConfig::default(),
            collab: CollabConfig::default(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &redact(&self.jwt_secret))
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("server", &self.server)
            .field("auth", &self.auth)
            .field("database", &self.database)
            .field("limits", &self.limits)
            .field("delivery", &self.delivery)
            .field("collab", &self.collab)
            .finish()
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &str) -> &'static str {
    if s.is_empty() { "None" } else { "[REDACTED]" }
}

impl AppConfig {
    /// Load configuration from the default path (`./tmhub.toml`), falling
    /// back to built-in defaults when the file is absent.
    ///
    /// Environment overrides applied after the file:
    /// - `TMHUB_JWT_SECRET`
    /// - `TMHUB_HOST`, `TMHUB_PORT`
    /// - `TMHUB_DB_PATH`
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("TMHUB_CONFIG").unwrap_or_else(|_| "tmhub.toml".into());
        let mut config = if Path::new(&path).exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };

        if let Ok(secret) = std::env::var("TMHUB_JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }
        if let Ok(host) = std::env::var("TMHUB_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("TMHUB_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid { reason: format!("TMHUB_PORT '{port}' is not a port number") })?;
        }
        if let Ok(db) = std::env::var("TMHUB_DB_PATH") {
            config.database.path = db;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load and parse a specific TOML file.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.into(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
    }

    /// Validate settings that cannot be expressed in types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "auth.jwt_secret is required (or set TMHUB_JWT_SECRET)".into(),
            });
        }
        if self.delivery.workers == 0 {
            return Err(ConfigError::Invalid { reason: "delivery.workers must be at least 1".into() });
        }
        if self.collab.send_buffer == 0 {
            return Err(ConfigError::Invalid { reason: "collab.send_buffer must be at least 1".into() });
        }
        if self.limits.api_requests_per_minute == 0 || self.limits.api_requests_per_hour == 0 {
            return Err(ConfigError::Invalid { reason: "rate limits must be positive".into() });
        }
        Ok(())
    }

    /// Pretty-printed default config, for `tmhub config init` style output.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}
