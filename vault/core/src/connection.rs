//! Connection-State Aggregation
//!
//! Combines the backend health snapshot and the chat socket status into the
//! capabilities the front-end cares about:
//!
//! | Capability | Requires |
//! |---|---|
//! | `can_view` | backend available |
//! | `can_browse` | backend available, tool server connected |
//! | `can_send` | backend available, socket connected, LLM available |
//!
//! [`derive_capabilities`] is a pure function; [`ConnectionMonitor`] keeps it
//! current by listening to both sources.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::health::{HealthMonitor, HealthResponse, HealthStatus, HealthUpdate, Service};
use crate::listeners::{ListenerSet, Subscription};
use crate::transport::{ChatSocket, ConnectionStatus};

/// Backend reachability as seen by the front-end
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// No check has completed yet
    #[default]
    Unknown,
    /// Backend answered and is not unhealthy
    Available,
    /// Backend answered `unhealthy`
    Unhealthy,
    /// Last check failed
    Unreachable,
}

/// Derived capability set
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCapabilities {
    /// Backend reachability
    pub backend: BackendState,
    /// Overall backend status from the last snapshot
    pub health: Option<HealthStatus>,
    /// Chat socket status
    pub socket: ConnectionStatus,
    /// Chat messages can be sent
    pub can_send: bool,
    /// Repositories can be browsed
    pub can_browse: bool,
    /// Cached documents can be viewed
    pub can_view: bool,
    /// Error text of the last failed health check
    pub error: Option<String>,
}

/// Service counts as available when the backend does not report it at all
fn service_up(response: &HealthResponse, service: Service) -> bool {
    response.service(service).map_or(true, |s| s.is_up())
}

/// Compute capabilities from a health outcome and the socket status
#[must_use]
pub fn derive_capabilities(
    health: Option<&HealthUpdate>,
    socket: ConnectionStatus,
) -> ConnectionCapabilities {
    let response = health.and_then(|h| h.response.as_deref());

    let backend = match (health, response) {
        (None, _) => BackendState::Unknown,
        (Some(_), Some(r)) if r.status.is_operational() => BackendState::Available,
        (Some(_), Some(_)) => BackendState::Unhealthy,
        (Some(_), None) => BackendState::Unreachable,
    };
    let available = backend == BackendState::Available;

    let mcp_up = response.is_some_and(|r| service_up(r, Service::McpServer));
    let llm_up = response.is_some_and(|r| service_up(r, Service::ClaudeApi));

    ConnectionCapabilities {
        backend,
        health: response.map(|r| r.status),
        socket,
        can_send: available && socket.is_connected() && llm_up,
        can_browse: available && mcp_up,
        can_view: available,
        error: health.and_then(|h| h.error.as_ref()).map(ToString::to_string),
    }
}

struct MonitorState {
    health: Option<HealthUpdate>,
    socket: ConnectionStatus,
    current: ConnectionCapabilities,
    sources: Vec<Subscription>,
}

struct MonitorInner {
    state: Mutex<MonitorState>,
    listeners: ListenerSet<ConnectionCapabilities>,
}

impl MonitorInner {
    fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut MonitorState),
    {
        let changed = {
            let mut state = self.state.lock();
            apply(&mut state);
            let next = derive_capabilities(state.health.as_ref(), state.socket);
            if next == state.current {
                None
            } else {
                state.current = next.clone();
                Some(next)
            }
        };

        if let Some(capabilities) = changed {
            tracing::debug!(
                backend = ?capabilities.backend,
                socket = %capabilities.socket,
                can_send = capabilities.can_send,
                can_browse = capabilities.can_browse,
                "Connection capabilities changed"
            );
            self.listeners.emit(&capabilities);
        }
    }
}

/// Keeps [`ConnectionCapabilities`] up to date
///
/// Subscribers are notified only when the derived set changes.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
    /// Start tracking `health` and `socket`
    #[must_use]
    pub fn new(health: &HealthMonitor, socket: &ChatSocket) -> Self {
        let initial_socket = socket.status();
        let inner = Arc::new(MonitorInner {
            state: Mutex::new(MonitorState {
                health: None,
                socket: initial_socket,
                current: derive_capabilities(None, initial_socket),
                sources: Vec::new(),
            }),
            listeners: ListenerSet::new(),
        });

        let weak = Arc::downgrade(&inner);
        let health_sub = health.subscribe(move |update| {
            if let Some(inner) = weak.upgrade() {
                let update = update.clone();
                inner.update(move |state| state.health = Some(update));
            }
        });

        let weak = Arc::downgrade(&inner);
        let socket_sub = socket.on_status_change(move |status| {
            if let Some(inner) = weak.upgrade() {
                let status = *status;
                inner.update(move |state| state.socket = status);
            }
        });

        inner.state.lock().sources = vec![health_sub, socket_sub];
        Self { inner }
    }

    /// Current capabilities
    #[must_use]
    pub fn capabilities(&self) -> ConnectionCapabilities {
        self.inner.state.lock().current.clone()
    }

    /// Register for capability changes; the current set is delivered immediately
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionCapabilities) + Send + Sync + 'static,
    {
        handler(&self.capabilities());
        self.inner.listeners.subscribe(handler)
    }

    /// Stop listening to the health monitor and the socket
    pub fn detach(&self) {
        let sources = std::mem::take(&mut self.inner.state.lock().sources);
        for sub in sources {
            sub.unsubscribe();
        }
    }
}
