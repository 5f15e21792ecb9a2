//! Streaming Transport
//!
//! The real-time half of the client: one WebSocket per conversation,
//! carrying JSON frames in both directions.
//!
//! - [`ChatSocket`]: connection state machine with reconnection, heartbeat,
//!   outbound queue and listener fan-out
//! - [`SocketConnector`]: seam for opening sockets; [`TungsteniteConnector`]
//!   is the production implementation
//!
//! # Close codes
//!
//! - 1000 / 1001: intentional close, no reconnection
//! - 4000: heartbeat timeout, closed by the client
//! - anything else (1006 when no close frame arrived): abnormal, reconnect

pub mod backoff;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod status;
pub mod traits;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

// Re-exports for convenience
pub use client::{ChatSocket, SendOutcome};
pub use config::TransportConfig;
pub use heartbeat::{HeartbeatStats, HEARTBEAT_CLOSE_CODE};
pub use status::ConnectionStatus;
pub use traits::{
    OutboundFrame, SocketChannels, SocketConnector, SocketEvent, TransportError, CLOSE_ABNORMAL,
    CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
pub use websocket::TungsteniteConnector;
