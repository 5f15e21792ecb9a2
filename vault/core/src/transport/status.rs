//! Connection Status
//!
//! The socket lifecycle as seen by the rest of the client.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Chat socket connection status
///
/// ```text
/// Disconnected/Failed --connect()--> Connecting --open--> Connected
/// Connecting/Connected --abnormal close--> Reconnecting --timer--> Connecting
/// Reconnecting --attempts exhausted--> Failed
/// Connected --close 1000/1001--> Disconnected
/// any --disconnect()--> Disconnected
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Socket construction in progress
    Connecting,
    /// Socket open, frames flow
    Connected,
    /// No socket and no pending reconnection
    #[default]
    Disconnected,
    /// Waiting for the backoff timer before the next attempt
    Reconnecting,
    /// Reconnection attempts exhausted
    Failed,
}

impl ConnectionStatus {
    /// Check if frames can be sent right now
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connection attempt is underway or scheduled
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Every state may move to `Disconnected` through an explicit disconnect.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Failed, Reconnecting};

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected | Failed, Connecting)
                | (Connecting, Connected | Reconnecting | Failed)
                | (Connected, Reconnecting | Failed | Connecting)
                | (Reconnecting, Connecting | Failed)
        )
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
