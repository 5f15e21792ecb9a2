//! Scripted connector for unit tests
//!
//! Every accepted `open` hands the test a [`MockPeer`]: the server side of
//! the socket, able to read what the client wrote and push events back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{OutboundFrame, SocketChannels, SocketConnector, SocketEvent, TransportError};

/// Outcome of one `open` call
#[derive(Clone, Copy, Debug)]
pub(crate) enum OpenOutcome {
    Accept,
    Refuse,
}

/// Server side of a mock socket
pub(crate) struct MockPeer {
    pub(crate) url: String,
    pub(crate) from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    pub(crate) to_client: mpsc::UnboundedSender<SocketEvent>,
}

impl MockPeer {
    /// Frames the client has written so far
    pub(crate) fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Text frames the client has written so far, parsed as JSON
    pub(crate) fn drain_json(&mut self) -> Vec<serde_json::Value> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Text(text) => serde_json::from_str(&text).ok(),
                OutboundFrame::Close { .. } => None,
            })
            .collect()
    }

    pub(crate) fn send_text(&self, text: &str) {
        let _ = self.to_client.send(SocketEvent::Text(text.to_string()));
    }

    pub(crate) fn send_json(&self, value: &serde_json::Value) {
        self.send_text(&value.to_string());
    }

    pub(crate) fn close(&self, code: u16) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code,
            reason: String::new(),
        });
    }

    /// Answer every ping with a pong until the client goes away
    pub(crate) fn answer_pings(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = self.from_client.recv().await {
                if let OutboundFrame::Text(text) = frame {
                    if text.contains("\"ping\"") {
                        self.send_text(r#"{"type":"pong"}"#);
                    }
                }
            }
        })
    }
}

/// Connector whose `open` outcomes are scripted by the test
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<OpenOutcome>>,
    default: OpenOutcome,
    opens: AtomicUsize,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    /// Connector accepting every open unless scripted otherwise
    pub(crate) fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        Self::with_default(OpenOutcome::Accept)
    }

    /// Connector refusing every open unless scripted otherwise
    pub(crate) fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        Self::with_default(OpenOutcome::Refuse)
    }

    fn with_default(default: OpenOutcome) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default,
            opens: AtomicUsize::new(0),
            peers: tx,
        });
        (connector, rx)
    }

    /// Queue the outcome of the next `open` calls
    pub(crate) fn script(&self, outcomes: &[OpenOutcome]) {
        self.script.lock().extend(outcomes.iter().copied());
    }

    /// Number of `open` calls so far
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn open(&self, url: &str) -> Result<SocketChannels, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(self.default);

        match outcome {
            OpenOutcome::Refuse => Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            )),
            OpenOutcome::Accept => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let _ = self.peers.send(MockPeer {
                    url: url.to_string(),
                    from_client: out_rx,
                    to_client: in_tx,
                });
                Ok(SocketChannels {
                    outgoing: out_tx,
                    incoming: in_rx,
                })
            }
        }
    }
}

/// Let spawned tasks run; with a paused clock this advances time by 1ms
pub(crate) async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
}
