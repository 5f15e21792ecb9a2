//! TOML Configuration File Support
//!
//! Centralized configuration for the portal client, read from
//! `~/.config/knowledge-vault/portal.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [api]
//! base_url = "https://vault.example.com"
//! timeout_ms = 30000
//!
//! [transport]
//! ws_base_url = "wss://vault.example.com"
//! reconnect_enabled = true
//! max_reconnect_attempts = 5
//! reconnect_interval_ms = 1000
//! max_reconnect_interval_ms = 30000
//! heartbeat_interval_ms = 30000
//! connect_timeout_ms = 10000
//!
//! [health]
//! interval_ms = 30000
//! timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiConfig;
use crate::health::HealthConfig;
use crate::transport::config::parse_millis;
use crate::transport::TransportConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the highest-priority configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[api]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToml {
    /// REST base URL
    pub base_url: Option<String>,
    /// Request timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// `[transport]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// WebSocket base URL
    pub ws_base_url: Option<String>,
    /// Whether to reconnect after abnormal closes
    pub reconnect_enabled: Option<bool>,
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: Option<u32>,
    /// Base reconnection delay in milliseconds
    pub reconnect_interval_ms: Option<u64>,
    /// Maximum reconnection delay in milliseconds
    pub max_reconnect_interval_ms: Option<u64>,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: Option<u64>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// `[health]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Polling interval in milliseconds
    pub interval_ms: Option<u64>,
    /// Per-check timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalToml {
    /// REST section
    pub api: ApiToml,
    /// WebSocket section
    pub transport: TransportToml,
    /// Health polling section
    pub health: HealthToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved client configuration
#[derive(Clone, Debug, PartialEq)]
pub struct PortalConfig {
    /// REST client settings
    pub api: ApiConfig,
    /// Chat socket settings
    pub transport: TransportConfig,
    /// Health polling settings
    pub health: HealthConfig,
    /// Path of the config file that was loaded, if any
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
    /// WebSocket URL was given explicitly, not derived from the API URL
    ws_url_pinned: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            transport: TransportConfig::default(),
            health: HealthConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
            ws_url_pinned: false,
        }
    }
}

impl PortalConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point both REST and WebSocket at one backend
    ///
    /// The WebSocket URL is derived by swapping `http` for `ws`.
    #[must_use]
    pub fn for_backend(api_base_url: &str) -> Self {
        let mut config = Self::default();
        config.api.base_url = api_base_url.to_string();
        config.transport.ws_base_url = ws_url_for(api_base_url);
        config
    }

    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.api.base_url.trim().is_empty() {
            return invalid("api.base_url must not be empty".into());
        }
        let ws = self.transport.ws_base_url.trim();
        if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
            return invalid(format!(
                "transport.ws_base_url must start with ws:// or wss:// (got {ws:?})"
            ));
        }

        let durations = [
            ("api.timeout_ms", self.api.timeout),
            ("transport.reconnect_interval_ms", self.transport.reconnect_interval),
            ("transport.heartbeat_interval_ms", self.transport.heartbeat_interval),
            ("transport.connect_timeout_ms", self.transport.connect_timeout),
            ("health.interval_ms", self.health.interval),
            ("health.timeout_ms", self.health.timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return invalid(format!("{name} must be greater than zero"));
        }

        if self.transport.max_reconnect_interval < self.transport.reconnect_interval {
            return invalid(
                "transport.max_reconnect_interval_ms must not be below reconnect_interval_ms"
                    .into(),
            );
        }
        Ok(())
    }
}

/// `http(s)://host` to `ws(s)://host`
#[must_use]
pub fn ws_url_for(api_base_url: &str) -> String {
    let url = api_base_url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/knowledge-vault/portal.toml`, typically
/// `~/.config/knowledge-vault/portal.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("knowledge-vault").join("portal.toml"))
}

/// Load configuration from the default file and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
/// A missing config file is not an error.
pub fn load_config() -> Result<PortalConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific file and the process environment
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_from_path(path: Option<&Path>) -> Result<PortalConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> Result<PortalConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = PortalConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: PortalToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup);
    Ok(config)
}

fn apply_toml_config(config: &mut PortalConfig, toml: &PortalToml) {
    if let Some(url) = &toml.api.base_url {
        config.api.base_url.clone_from(url);
        if toml.transport.ws_base_url.is_none() {
            config.transport.ws_base_url = ws_url_for(url);
        }
    }
    if let Some(ms) = toml.api.timeout_ms {
        config.api.timeout = Duration::from_millis(ms);
    }

    let t = &toml.transport;
    if let Some(url) = &t.ws_base_url {
        config.transport.ws_base_url.clone_from(url);
        config.ws_url_pinned = true;
    }
    if let Some(enabled) = t.reconnect_enabled {
        config.transport.reconnect_enabled = enabled;
    }
    if let Some(attempts) = t.max_reconnect_attempts {
        config.transport.max_reconnect_attempts = attempts;
    }
    if let Some(ms) = t.reconnect_interval_ms {
        config.transport.reconnect_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = t.max_reconnect_interval_ms {
        config.transport.max_reconnect_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = t.heartbeat_interval_ms {
        config.transport.heartbeat_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = t.connect_timeout_ms {
        config.transport.connect_timeout = Duration::from_millis(ms);
    }

    if let Some(ms) = toml.health.interval_ms {
        config.health.interval = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.health.timeout_ms {
        config.health.timeout = Duration::from_millis(ms);
    }
}

/// Environment variables read on top of the file
pub const ENV_VARS: &[&str] = &[
    "VAULT_API_URL",
    "VAULT_API_TIMEOUT_MS",
    "VAULT_HEALTH_INTERVAL_MS",
    "VAULT_HEALTH_TIMEOUT_MS",
    "VAULT_WS_URL",
    "VAULT_WS_RECONNECT",
    "VAULT_WS_MAX_RECONNECT_ATTEMPTS",
    "VAULT_WS_RECONNECT_INTERVAL_MS",
    "VAULT_WS_MAX_RECONNECT_INTERVAL_MS",
    "VAULT_WS_HEARTBEAT_INTERVAL_MS",
    "VAULT_WS_CONNECT_TIMEOUT_MS",
];

fn apply_env_config<F>(config: &mut PortalConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if ENV_VARS.iter().copied().any(|key| lookup(key).is_some()) {
        config.source = ConfigSource::Env;
    }

    let ws_from_env = lookup("VAULT_WS_URL").is_some_and(|v| !v.trim().is_empty());
    if let Some(url) = lookup("VAULT_API_URL").filter(|v| !v.trim().is_empty()) {
        if !ws_from_env && !config.ws_url_pinned {
            config.transport.ws_base_url = ws_url_for(&url);
        }
        config.api.base_url = url;
    }
    if let Some(d) = lookup("VAULT_API_TIMEOUT_MS").and_then(|v| parse_millis(&v)) {
        config.api.timeout = d;
    }
    if let Some(d) = lookup("VAULT_HEALTH_INTERVAL_MS").and_then(|v| parse_millis(&v)) {
        config.health.interval = d;
    }
    if let Some(d) = lookup("VAULT_HEALTH_TIMEOUT_MS").and_then(|v| parse_millis(&v)) {
        config.health.timeout = d;
    }

    config.transport.apply_env(&lookup);
    if ws_from_env {
        config.ws_url_pinned = true;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// REST base URL
    pub api_url: Option<String>,
    /// WebSocket base URL
    pub ws_url: Option<String>,
    /// Disable automatic reconnection
    pub no_reconnect: bool,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the REST base URL
    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Override the WebSocket base URL
    #[must_use]
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Disable automatic reconnection
    #[must_use]
    pub fn without_reconnect(mut self) -> Self {
        self.no_reconnect = true;
        self
    }

    /// Override the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(ms);
        self
    }

    fn is_empty(&self) -> bool {
        self.api_url.is_none()
            && self.ws_url.is_none()
            && !self.no_reconnect
            && self.heartbeat_interval_ms.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut PortalConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(url) = &self.api_url {
            config.api.base_url.clone_from(url);
            if self.ws_url.is_none() && !config.ws_url_pinned {
                config.transport.ws_base_url = ws_url_for(url);
            }
        }
        if let Some(url) = &self.ws_url {
            config.transport.ws_base_url.clone_from(url);
            config.ws_url_pinned = true;
        }
        if self.no_reconnect {
            config.transport.reconnect_enabled = false;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.transport.heartbeat_interval = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
