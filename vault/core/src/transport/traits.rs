//! Transport Traits
//!
//! The seam between the socket state machine ([`super::ChatSocket`]) and the
//! code that actually opens a WebSocket. Production uses
//! [`super::TungsteniteConnector`]; tests plug in scripted connectors.
//!
//! An opened socket is a pair of channels:
//! - `outgoing`: frames the client wants written (text or close)
//! - `incoming`: events read from the wire, ending with exactly one `Closed`

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Close code for a normal, intentional close
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for an endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code reported when a close frame carried no status
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Whether a close code means the peer intended to close
#[must_use]
pub fn is_intentional_close(code: u16) -> bool {
    code == CLOSE_NORMAL || code == CLOSE_GOING_AWAY
}

/// Errors reported by the chat socket
///
/// These are delivered to `on_error` subscribers; the socket recovers from
/// them through its own state machine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Socket could not be constructed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection closed abnormally
    #[error("Connection closed (code {code}): {reason}")]
    ConnectionClosed {
        /// WebSocket close code
        code: u16,
        /// Close reason, possibly empty
        reason: String,
    },

    /// No pong arrived within the liveness window
    #[error("Heartbeat timeout: no pong for {silence_ms}ms")]
    HeartbeatTimeout {
        /// Milliseconds since the last sign of life
        silence_ms: u64,
    },

    /// Reconnection gave up
    #[error("Max reconnection attempts ({attempts}) reached")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Writing a frame failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A frame could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Frame the client asks the writer to put on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// UTF-8 text frame
    Text(String),
    /// Close frame; the writer stops after sending it
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Event read from an open socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// UTF-8 text frame
    Text(String),
    /// The connection ended; always the last event
    Closed {
        /// Close code (1006 when no close frame was seen)
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Channels of an open socket
#[derive(Debug)]
pub struct SocketChannels {
    /// Frames to write
    pub outgoing: mpsc::UnboundedSender<OutboundFrame>,
    /// Frames read
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens WebSocket connections
///
/// `open` resolves once the socket is established (the "open" event of the
/// state machine) or fails with [`TransportError::ConnectionFailed`].
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `url`
    async fn open(&self, url: &str) -> Result<SocketChannels, TransportError>;
}
