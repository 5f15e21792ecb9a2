//! Backend Health Monitoring
//!
//! Polls `GET {api_base_url}/health` and keeps the latest snapshot.
//!
//! ```text
//! {"status":"degraded","version":"1.0.0",
//!  "services":{"mcp_server":{"status":"disconnected"},
//!              "claude_api":{"status":"available","model":"..."}}}
//! ```
//!
//! Every check either replaces the snapshot (success) or clears it and
//! records the error (failure), then notifies subscribers with the pair.
//! Errors from the polling loop are logged and absorbed; direct callers of
//! [`HealthMonitor::check`] receive them.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::listeners::{ListenerSet, Subscription};

// ============================================================================
// Health Response
// ============================================================================

/// Overall backend status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All services up
    Healthy,
    /// Chat works, some services down
    Degraded,
    /// Backend cannot serve chat
    Unhealthy,
}

impl HealthStatus {
    /// Check if the backend is usable at all
    #[must_use]
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Status of one backend dependency
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Service status string (`connected`, `available`, `disconnected`, ...)
    pub status: String,
    /// Model name, for the LLM service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ServiceHealth {
    /// Whether the status string means the service is up
    #[must_use]
    pub fn is_up(&self) -> bool {
        ["connected", "available", "healthy", "ok"]
            .iter()
            .any(|s| self.status.eq_ignore_ascii_case(s))
    }
}

/// Per-dependency status block
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Services {
    /// Documentation tool server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<ServiceHealth>,
    /// LLM provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_api: Option<ServiceHealth>,
    /// GitHub API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_api: Option<ServiceHealth>,
}

/// Backend cache statistics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Cached items
    pub item_count: u64,
    /// Cache hit rate in `[0, 1]`
    pub hit_rate: f64,
}

/// Body of `GET /health`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status
    pub status: HealthStatus,
    /// Backend version
    #[serde(default)]
    pub version: String,
    /// Server timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Uptime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    /// Dependency status
    #[serde(default)]
    pub services: Services,
    /// Cache statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

/// Backend dependency named in the health response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    /// Documentation tool server
    McpServer,
    /// LLM provider
    ClaudeApi,
    /// GitHub API
    GithubApi,
}

impl HealthResponse {
    /// Status block for a service, if the backend reported one
    #[must_use]
    pub fn service(&self, service: Service) -> Option<&ServiceHealth> {
        match service {
            Service::McpServer => self.services.mcp_server.as_ref(),
            Service::ClaudeApi => self.services.claude_api.as_ref(),
            Service::GithubApi => self.services.github_api.as_ref(),
        }
    }
}

// ============================================================================
// Errors and updates
// ============================================================================

/// Why a health check failed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    /// No response within the check timeout
    #[error("Health check timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Connection refused or host unreachable
    #[error("Cannot connect to backend at {url}. Is the server running?")]
    Unreachable {
        /// Base URL that was tried
        url: String,
    },

    /// Non-success HTTP status
    #[error("Health check failed: HTTP {status}")]
    Http {
        /// Status code
        status: u16,
    },

    /// Body was not a health response
    #[error("Invalid health response: {0}")]
    InvalidResponse(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Outcome of one health check, as delivered to subscribers
///
/// Exactly one of `response` and `error` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthUpdate {
    /// Snapshot on success
    pub response: Option<Arc<HealthResponse>>,
    /// Error on failure
    pub error: Option<HealthError>,
}

impl HealthUpdate {
    fn from_result(result: &Result<Arc<HealthResponse>, HealthError>) -> Self {
        match result {
            Ok(response) => Self {
                response: Some(Arc::clone(response)),
                error: None,
            },
            Err(err) => Self {
                response: None,
                error: Some(err.clone()),
            },
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Polling settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between checks
    pub interval: Duration,
    /// Per-check request timeout
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

struct HealthState {
    last: Option<HealthUpdate>,
    poller: Option<JoinHandle<()>>,
}

struct HealthInner {
    base_url: String,
    url: String,
    config: HealthConfig,
    client: reqwest::Client,
    state: Mutex<HealthState>,
    listeners: ListenerSet<HealthUpdate>,
}

impl Drop for HealthInner {
    fn drop(&mut self) {
        if let Some(poller) = self.state.get_mut().poller.take() {
            poller.abort();
        }
    }
}

/// Backend health monitor
///
/// Cheap to clone; clones share the snapshot and the polling task.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<HealthInner>,
}

impl HealthMonitor {
    /// Create a monitor for the backend at `api_base_url`
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::Client`] if the HTTP client cannot be built.
    pub fn new(api_base_url: &str, config: HealthConfig) -> Result<Self, HealthError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HealthError::Client(e.to_string()))?;

        let base_url = api_base_url.trim_end_matches('/').to_string();
        Ok(Self {
            inner: Arc::new(HealthInner {
                url: format!("{base_url}/health"),
                base_url,
                config,
                client,
                state: Mutex::new(HealthState {
                    last: None,
                    poller: None,
                }),
                listeners: ListenerSet::new(),
            }),
        })
    }

    /// Run one health check and publish the outcome
    ///
    /// # Errors
    ///
    /// Returns the classified failure; the cached snapshot is cleared.
    pub async fn check(&self) -> Result<Arc<HealthResponse>, HealthError> {
        let result = self.fetch().await.map(Arc::new);
        let update = HealthUpdate::from_result(&result);

        match &result {
            Ok(response) => tracing::debug!(status = %response.status, "Health check ok"),
            Err(e) => tracing::debug!(error = %e, "Health check failed"),
        }

        self.inner.state.lock().last = Some(update.clone());
        self.inner.listeners.emit(&update);
        result
    }

    async fn fetch(&self) -> Result<HealthResponse, HealthError> {
        let response = self
            .inner
            .client
            .get(&self.inner.url)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HealthError::Http {
                status: status.as_u16(),
            });
        }

        response.json::<HealthResponse>().await.map_err(|e| {
            if e.is_timeout() {
                self.timeout_error()
            } else {
                HealthError::InvalidResponse(e.to_string())
            }
        })
    }

    fn classify(&self, err: &reqwest::Error) -> HealthError {
        if err.is_timeout() {
            self.timeout_error()
        } else if let Some(status) = err.status() {
            HealthError::Http {
                status: status.as_u16(),
            }
        } else {
            HealthError::Unreachable {
                url: self.inner.base_url.clone(),
            }
        }
    }

    fn timeout_error(&self) -> HealthError {
        HealthError::Timeout {
            timeout_ms: u64::try_from(self.inner.config.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Start periodic polling, checking immediately
    ///
    /// Idempotent: at most one polling task runs.
    pub fn start_monitoring(&self) {
        let mut state = self.inner.state.lock();
        if state.poller.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }

        let interval = self.inner.config.interval;
        tracing::info!(
            url = %self.inner.url,
            interval_secs = interval.as_secs(),
            "Starting health monitoring"
        );

        let weak: Weak<HealthInner> = Arc::downgrade(&self.inner);
        state.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let monitor = HealthMonitor { inner };
                if let Err(e) = monitor.check().await {
                    tracing::warn!(error = %e, "Backend health check failed");
                }
            }
        }));
    }

    /// Stop periodic polling
    pub fn stop_monitoring(&self) {
        if let Some(poller) = self.inner.state.lock().poller.take() {
            poller.abort();
            tracing::info!("Health monitoring stopped");
        }
    }

    /// Whether the polling task is running
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.inner
            .state
            .lock()
            .poller
            .as_ref()
            .is_some_and(|p| !p.is_finished())
    }

    /// Register for check outcomes
    ///
    /// The last outcome, if any, is delivered immediately.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&HealthUpdate) + Send + Sync + 'static,
    {
        let last = self.inner.state.lock().last.clone();
        if let Some(update) = last {
            callback(&update);
        }
        self.inner.listeners.subscribe(callback)
    }

    /// Latest snapshot, if the last check succeeded
    #[must_use]
    pub fn response(&self) -> Option<Arc<HealthResponse>> {
        self.inner
            .state
            .lock()
            .last
            .as_ref()
            .and_then(|u| u.response.clone())
    }

    /// Error of the last check, if it failed
    #[must_use]
    pub fn last_error(&self) -> Option<HealthError> {
        self.inner
            .state
            .lock()
            .last
            .as_ref()
            .and_then(|u| u.error.clone())
    }

    /// Overall status from the latest snapshot
    #[must_use]
    pub fn status(&self) -> Option<HealthStatus> {
        self.response().map(|r| r.status)
    }

    /// Whether the backend answered and is not unhealthy
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status().is_some_and(HealthStatus::is_operational)
    }

    /// Whether the latest snapshot reports `service` as up
    #[must_use]
    pub fn is_service_connected(&self, service: Service) -> bool {
        self.response()
            .and_then(|r| r.service(service).map(ServiceHealth::is_up))
            .unwrap_or(false)
    }

    /// Health endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("url", &self.inner.url)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}
