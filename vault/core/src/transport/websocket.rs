//! WebSocket Connector
//!
//! Production [`SocketConnector`] built on `tokio-tungstenite`.
//!
//! Each opened socket is split into two tasks:
//! - a writer draining [`OutboundFrame`]s into the sink, stopping after a close
//! - a reader forwarding text frames as [`SocketEvent::Text`] and finishing
//!   with exactly one [`SocketEvent::Closed`]
//!
//! The reader stops as soon as the consumer drops its receiver, so tearing
//! down a connection never leaves a task behind.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::traits::{
    OutboundFrame, SocketChannels, SocketConnector, SocketEvent, TransportError, CLOSE_ABNORMAL,
    CLOSE_NO_STATUS,
};

/// Opens chat sockets with `tokio-tungstenite`
#[derive(Clone, Debug)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    /// Create a connector that gives up on handshakes after `connect_timeout`
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn open(&self, url: &str) -> Result<SocketChannels, TransportError> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "Connection timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::debug!(url = %url, "WebSocket handshake complete");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "WebSocket write error");
                            break;
                        }
                    }
                    OutboundFrame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(close))).await {
                            tracing::debug!(error = %e, "Close frame not delivered");
                        }
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut close: Option<(u16, String)> = None;

            loop {
                let next = tokio::select! {
                    () = in_tx.closed() => return,
                    next = read.next() => next,
                };

                match next {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(SocketEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close = Some(frame.map_or_else(
                            || (CLOSE_NO_STATUS, String::new()),
                            |f| (u16::from(f.code), f.reason.into_owned()),
                        ));
                        break;
                    }
                    // Control and binary frames carry nothing for the chat stream
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket read error");
                        break;
                    }
                    None => break,
                }
            }

            let (code, reason) = close.unwrap_or((CLOSE_ABNORMAL, String::new()));
            let _ = in_tx.send(SocketEvent::Closed { code, reason });
        });

        Ok(SocketChannels {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
