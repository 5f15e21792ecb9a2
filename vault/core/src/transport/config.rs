//! Transport Configuration
//!
//! Reconnection, heartbeat and endpoint settings for the chat socket.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default WebSocket base URL
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000";

/// Chat socket configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket base URL (`ws://` or `wss://`)
    ///
    /// The chat endpoint is `{ws_base_url}/ws/chat/{conversation_id}`.
    pub ws_base_url: String,

    /// Whether abnormal closes trigger automatic reconnection
    pub reconnect_enabled: bool,

    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Base reconnection delay; doubles with every attempt
    pub reconnect_interval: Duration,

    /// Upper bound for the reconnection delay
    pub max_reconnect_interval: Duration,

    /// Interval between heartbeat pings
    ///
    /// A connection without a pong for twice this interval is considered dead.
    pub heartbeat_interval: Duration,

    /// How long socket construction may take before it counts as failed
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_URL.to_string(),
            reconnect_enabled: true,
            max_reconnect_attempts: 5,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Create configuration pointing at the given WebSocket base URL
    #[must_use]
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into(),
            ..Default::default()
        }
    }

    /// Configuration with short timers, for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_interval: Duration::from_millis(1600),
            heartbeat_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    /// Enable or disable automatic reconnection
    #[must_use]
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    /// Set the maximum number of reconnection attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the base and maximum reconnection delay
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_interval = base;
        self.max_reconnect_interval = max;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `VAULT_WS_URL`: WebSocket base URL
    /// - `VAULT_WS_RECONNECT`: "0" or "false" to disable reconnection
    /// - `VAULT_WS_MAX_RECONNECT_ATTEMPTS`: Number of reconnection attempts
    /// - `VAULT_WS_RECONNECT_INTERVAL_MS`: Base reconnection delay in ms
    /// - `VAULT_WS_MAX_RECONNECT_INTERVAL_MS`: Maximum reconnection delay in ms
    /// - `VAULT_WS_HEARTBEAT_INTERVAL_MS`: Heartbeat interval in ms
    /// - `VAULT_WS_CONNECT_TIMEOUT_MS`: Connection timeout in ms
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values found through `lookup` onto this configuration
    ///
    /// Unparseable values are ignored and the current value kept.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("VAULT_WS_URL").filter(|v| !v.trim().is_empty()) {
            self.ws_base_url = url;
        }
        if let Some(enabled) = lookup("VAULT_WS_RECONNECT") {
            self.reconnect_enabled = parse_flag(&enabled);
        }
        if let Some(attempts) = lookup("VAULT_WS_MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_reconnect_attempts = attempts;
        }
        if let Some(d) = lookup("VAULT_WS_RECONNECT_INTERVAL_MS").and_then(|v| parse_millis(&v)) {
            self.reconnect_interval = d;
        }
        if let Some(d) = lookup("VAULT_WS_MAX_RECONNECT_INTERVAL_MS").and_then(|v| parse_millis(&v)) {
            self.max_reconnect_interval = d;
        }
        if let Some(d) = lookup("VAULT_WS_HEARTBEAT_INTERVAL_MS").and_then(|v| parse_millis(&v)) {
            self.heartbeat_interval = d;
        }
        if let Some(d) = lookup("VAULT_WS_CONNECT_TIMEOUT_MS").and_then(|v| parse_millis(&v)) {
            self.connect_timeout = d;
        }
    }

    /// Chat endpoint URL for a conversation
    #[must_use]
    pub fn chat_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/ws/chat/{}",
            self.ws_base_url.trim_end_matches('/'),
            conversation_id
        )
    }

    /// Delay before reconnection attempt number `attempt` (0-based)
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        super::backoff::reconnect_delay(
            attempt,
            self.reconnect_interval,
            self.max_reconnect_interval,
        )
    }

    /// Silence window after which the heartbeat declares the socket dead
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(2)
    }
}

/// Parse an on/off environment flag ("0"/"false" disable, anything else enables)
pub(crate) fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Parse a millisecond count
pub(crate) fn parse_millis(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_millis)
}
