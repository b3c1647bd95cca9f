//! Configuration management for labterm.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/labterm/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionConfig;
use crate::transport::phoenix::SocketConfig;

/// Default terminal server host.
pub const DEFAULT_HOST: &str = "ile.learn.co";

/// Default terminal server port.
pub const DEFAULT_PORT: u16 = 443;

/// Default socket mount path on the server.
pub const DEFAULT_PATH: &str = "v2/terminal";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host must be a bare hostname, got {0:?}")]
    InvalidHost(String),

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("client must not be empty")]
    EmptyClient,

    #[error("username must not be empty or contain ':', got {0:?}")]
    InvalidUsername(String),

    #[error("lab_slug must not be empty or contain ':', got {0:?}")]
    InvalidLabSlug(String),

    #[error("heartbeat_interval_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("initial_backoff_ms must be greater than 0 and at most max_backoff_ms ({max}), got {initial}")]
    InvalidBackoff { initial: u64, max: u64 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} is required to open a session")]
    MissingCredential(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for labterm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Terminal server location.
    pub server: ServerConfig,

    /// Credentials.
    pub auth: AuthConfig,

    /// Which lab the session opens in.
    pub lab: LabConfig,

    /// Socket keepalive and reconnection.
    pub network: NetworkConfig,

    /// Logging.
    pub log: LogConfig,
}

/// Terminal server location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Server hostname.
    pub host: String,

    /// Server port. 443 selects `wss`, anything else `ws`.
    pub port: u16,

    /// Socket mount path, without the `/websocket` suffix.
    pub path: String,

    /// Client tag sent to the server.
    pub client: String,
}

/// Credentials for the terminal server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Opaque authentication token.
    pub token: String,

    /// Account username; part of the channel name.
    pub username: String,
}

/// Lab selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabConfig {
    /// Lab to open. When unset the session opens in the default workspace.
    pub lab_slug: Option<String>,

    /// Open in the persistent home workspace rather than a temporary one.
    pub open_on_home: bool,
}

/// Socket keepalive and reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Seconds between heartbeats.
    pub heartbeat_interval_secs: u64,

    /// Reconnect the socket after it drops.
    pub auto_reconnect: bool,

    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds.
    pub max_backoff_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            client: crate::session::DEFAULT_CLIENT_ID.to_string(),
        }
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            lab_slug: None,
            open_on_home: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            auto_reconnect: true,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labterm")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - LABTERM_HOST, LABTERM_PORT: server location
    /// - LABTERM_TOKEN, LABTERM_USERNAME: credentials
    /// - LABTERM_LAB: lab slug
    /// - LABTERM_LOG_LEVEL: log level
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = env_value("LABTERM_HOST") {
            tracing::info!("Overriding host from environment: {}", host);
            self.server.host = host;
        }

        if let Some(port) = env_value("LABTERM_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(e) => {
                    tracing::warn!(value = %port, error = %e, "Ignoring invalid LABTERM_PORT");
                }
            }
        }

        if let Some(token) = env_value("LABTERM_TOKEN") {
            tracing::info!("Overriding token from environment");
            self.auth.token = token;
        }

        if let Some(username) = env_value("LABTERM_USERNAME") {
            tracing::info!("Overriding username from environment: {}", username);
            self.auth.username = username;
        }

        if let Some(lab) = env_value("LABTERM_LAB") {
            tracing::info!("Overriding lab_slug from environment: {}", lab);
            self.lab.lab_slug = Some(lab);
        }

        if let Some(level) = env_value("LABTERM_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.log.level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Credentials are not checked here; see [`Config::session_config`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = &self.server.host;
        let bad_char = |c: char| matches!(c, '/' | ':' | '?' | '#') || c.is_whitespace();
        if host.is_empty() || host.contains(bad_char) {
            return Err(ConfigError::InvalidHost(host.clone()));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        if self.server.client.trim().is_empty() {
            return Err(ConfigError::EmptyClient);
        }

        if !self.auth.username.is_empty() && !is_topic_segment(&self.auth.username) {
            return Err(ConfigError::InvalidUsername(self.auth.username.clone()));
        }

        if let Some(slug) = &self.lab.lab_slug {
            if !is_topic_segment(slug) {
                return Err(ConfigError::InvalidLabSlug(slug.clone()));
            }
        }

        let heartbeat = self.network.heartbeat_interval_secs;
        if heartbeat == 0 || heartbeat > 3600 {
            return Err(ConfigError::InvalidHeartbeatInterval(heartbeat));
        }

        let (initial, max) = (self.network.initial_backoff_ms, self.network.max_backoff_ms);
        if initial == 0 || initial > max {
            return Err(ConfigError::InvalidBackoff { initial, max });
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Build the immutable session parameters.
    ///
    /// Fails when the token or username is missing.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        if self.auth.token.is_empty() {
            return Err(ConfigError::MissingCredential("auth.token"));
        }
        if self.auth.username.is_empty() {
            return Err(ConfigError::MissingCredential("auth.username"));
        }

        let mut config = SessionConfig::new(
            self.server.host.clone(),
            self.server.port,
            self.server.path.clone(),
            self.auth.token.clone(),
            self.auth.username.clone(),
        )
        .with_client_id(self.server.client.clone());

        if let Some(slug) = &self.lab.lab_slug {
            config = config.with_lab_slug(slug.clone());
        }

        Ok(config)
    }

    /// Build the socket keepalive and reconnection settings.
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig::default()
            .with_auto_reconnect(self.network.auto_reconnect)
            .with_initial_backoff(Duration::from_millis(self.network.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.network.max_backoff_ms))
            .with_heartbeat_interval(Duration::from_secs(self.network.heartbeat_interval_secs))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Read an environment variable, treating empty values as unset.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Channel topics are `:`-separated, so segments must not contain one.
fn is_topic_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains(':')
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
