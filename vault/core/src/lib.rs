//! Vault Core - Headless Chat Client for the Knowledge Vault Portal
//!
//! Client-side core of the documentation portal: real-time chat transport,
//! backend health monitoring, connection capabilities and the streaming
//! chat controller. Independent of any UI; the `vault-chat` terminal
//! front-end is one consumer.
//!
//! # Architecture
//!
//! ```text
//!  front-end ──send_message──► ChatSession ──► ChatSocket ──► /ws/chat/{id}
//!      ▲                           │               │
//!      │ ChatUpdate                │ events        │ status
//!      └───────────────────────────┘               ▼
//!      ▲                                  ConnectionMonitor ◄── HealthMonitor ◄── GET /health
//!      └──────── ConnectionCapabilities ──────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: WebSocket client with reconnection, heartbeat and queue
//! - [`health`]: Backend health polling
//! - [`connection`]: Capability set derived from health and socket status
//! - [`chat`]: Streaming chat controller and message model
//! - [`protocol`]: JSON frames exchanged with the chat backend
//! - [`api`]: REST client for repositories, documents and conversations
//! - [`config`]: TOML / environment / CLI configuration
//! - [`session`]: Composition root tying the components together
//! - [`listeners`]: Subscription-based fan-out used by every component

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod health;
pub mod listeners;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use api::{ApiClient, ApiConfig, ApiError};
pub use chat::{
    ChatSession, ChatUpdate, Message, MessageId, ResponseSource, Role, SocketResponseSource,
    StreamError, ToolCall, ToolStatus, TurnOutcome, APOLOGY,
};
pub use connection::{derive_capabilities, BackendState, ConnectionCapabilities, ConnectionMonitor};
pub use health::{
    HealthConfig, HealthError, HealthMonitor, HealthResponse, HealthStatus, HealthUpdate, Service,
};
pub use listeners::{ListenerSet, Subscription};
pub use protocol::{ChatContext, ClientMessage, ContextScope, DocumentReference, ServerMessage};
pub use session::PortalSession;
pub use transport::{ChatSocket, ConnectionStatus, SendOutcome, TransportConfig, TransportError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, PortalConfig,
};
