//! Chat Socket Client
//!
//! One WebSocket bound to a conversation id, with automatic reconnection,
//! heartbeat liveness detection, an outbound queue and listener fan-out.
//!
//! # State machine
//!
//! | From | Event | To |
//! |---|---|---|
//! | disconnected / failed | `connect()` | connecting |
//! | connecting | socket open | connected |
//! | connecting | open failure | reconnecting, or failed |
//! | connected | close 1000/1001 | disconnected |
//! | connected | other close codes | reconnecting, or failed |
//! | connected | no pong for 2× heartbeat interval | close 4000, reconnecting or failed |
//! | reconnecting | backoff timer | connecting |
//! | any | `disconnect()` | disconnected |
//!
//! # Tasks
//!
//! Each connection attempt gets a generation number and a cancellation
//! token. The connection task (open + read loop), the heartbeat task and the
//! reconnect timer hold only a `Weak` reference to the socket plus the
//! generation they were started for; anything they report for a stale
//! generation is ignored.
//!
//! Listener callbacks always run after the state lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::TransportConfig;
use super::heartbeat::{HeartbeatStats, HeartbeatTracker, HEARTBEAT_CLOSE_CODE};
use super::status::ConnectionStatus;
use super::traits::{
    is_intentional_close, OutboundFrame, SocketConnector, SocketEvent, TransportError,
    CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use super::websocket::TungsteniteConnector;
use crate::listeners::{ListenerSet, Subscription};
use crate::protocol::{ChatContext, ClientMessage, ServerMessage};

/// What happened to a `send_message` call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open socket
    Sent,
    /// Held in the outbound queue until the next connection
    Queued,
    /// Not written, and not a frame that waits for a connection
    Dropped,
}

/// Listener work collected under the lock and dispatched after it
enum Notice {
    Status(ConnectionStatus),
    Error(TransportError),
}

/// The live (or opening) connection
struct Connection {
    cancel: CancellationToken,
    outgoing: Option<mpsc::UnboundedSender<OutboundFrame>>,
    heartbeat: Option<HeartbeatTracker>,
}

impl Connection {
    /// Stop the connection's tasks, sending a close frame if the socket is open
    fn shutdown(self, code: u16, reason: &str) {
        if let Some(tx) = self.outgoing {
            let _ = tx.send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.cancel.cancel();
    }
}

struct SocketState {
    status: ConnectionStatus,
    conversation_id: Option<String>,
    generation: u64,
    connection: Option<Connection>,
    reconnect_timer: Option<CancellationToken>,
    reconnect_attempts: u32,
    queue: VecDeque<ClientMessage>,
}

impl SocketState {
    fn set_status(&mut self, next: ConnectionStatus, notices: &mut Vec<Notice>) {
        if self.status == next {
            return;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(from = %self.status, to = %next, "Unexpected status transition");
        }
        tracing::debug!(from = %self.status, to = %next, "Connection status changed");
        self.status = next;
        notices.push(Notice::Status(next));
    }

    fn open_sender(&self) -> Option<&mpsc::UnboundedSender<OutboundFrame>> {
        if !self.status.is_connected() {
            return None;
        }
        self.connection.as_ref()?.outgoing.as_ref()
    }

    /// Queue a frame that could not be written
    fn hold(&mut self, frame: ClientMessage) -> SendOutcome {
        if frame.is_queueable() {
            self.queue.push_back(frame);
            SendOutcome::Queued
        } else {
            SendOutcome::Dropped
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
    }

    /// Drop the current connection and invalidate every task started for it
    fn teardown(&mut self, code: u16, reason: &str) {
        self.cancel_reconnect_timer();
        if let Some(connection) = self.connection.take() {
            connection.shutdown(code, reason);
        }
        self.generation += 1;
    }
}

struct SocketInner {
    config: TransportConfig,
    connector: Arc<dyn SocketConnector>,
    state: Mutex<SocketState>,
    message_listeners: ListenerSet<ServerMessage>,
    status_listeners: ListenerSet<ConnectionStatus>,
    error_listeners: ListenerSet<TransportError>,
}

/// Reconnecting chat WebSocket client
///
/// Cheap to clone; clones share the same connection. The connection closes
/// when the last clone is dropped.
///
/// Methods that start background work (`connect`, `send_message` flushing on
/// open) must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct ChatSocket {
    inner: Arc<SocketInner>,
}

impl ChatSocket {
    /// Create a socket client using the `tokio-tungstenite` connector
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let connector = Arc::new(TungsteniteConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Create a socket client with a custom connector
    #[must_use]
    pub fn with_connector(config: TransportConfig, connector: Arc<dyn SocketConnector>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                config,
                connector,
                state: Mutex::new(SocketState {
                    status: ConnectionStatus::Disconnected,
                    conversation_id: None,
                    generation: 0,
                    connection: None,
                    reconnect_timer: None,
                    reconnect_attempts: 0,
                    queue: VecDeque::new(),
                }),
                message_listeners: ListenerSet::new(),
                status_listeners: ListenerSet::new(),
                error_listeners: ListenerSet::new(),
            }),
        }
    }

    /// Connect to the chat endpoint of `conversation_id`
    ///
    /// A no-op when already connected (or connecting) to the same
    /// conversation. A different conversation closes the current socket
    /// first. Calling this from `Failed` starts over with a fresh attempt
    /// counter.
    pub fn connect(&self, conversation_id: &str) {
        let mut notices = Vec::new();
        {
            let mut state = self.inner.state.lock();

            let same_conversation = state.conversation_id.as_deref() == Some(conversation_id);
            if same_conversation
                && matches!(
                    state.status,
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                )
            {
                tracing::debug!(conversation_id = %conversation_id, "Already connected");
                return;
            }

            if !same_conversation {
                if let Some(previous) = state.conversation_id.as_deref() {
                    tracing::info!(
                        from = %previous,
                        to = %conversation_id,
                        "Switching conversation"
                    );
                }
            }

            state.teardown(CLOSE_NORMAL, "switching conversation");
            state.conversation_id = Some(conversation_id.to_string());
            state.reconnect_attempts = 0;
            self.inner.open_locked(&mut state, &mut notices);
        }
        self.inner.dispatch(notices);
    }

    /// Close the socket and forget the conversation
    ///
    /// Cancels any pending reconnection, stops the heartbeat, closes with
    /// code 1000 and clears the outbound queue. A later `connect` behaves
    /// like the first one.
    pub fn disconnect(&self) {
        let mut notices = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(id) = state.conversation_id.take() {
                tracing::info!(conversation_id = %id, "Disconnecting");
            }
            state.teardown(CLOSE_NORMAL, "client disconnect");
            state.queue.clear();
            state.reconnect_attempts = 0;
            state.set_status(ConnectionStatus::Disconnected, &mut notices);
        }
        self.inner.dispatch(notices);
    }

    /// Send a chat message, queueing it while the socket is not open
    pub fn send_message(
        &self,
        content: impl Into<String>,
        context: Option<ChatContext>,
    ) -> SendOutcome {
        let outcome = self.send_frame(ClientMessage::Message {
            content: content.into(),
            context,
        });
        if outcome == SendOutcome::Queued {
            tracing::debug!("Message queued until the socket opens");
        }
        outcome
    }

    /// Ask the server to stop the current turn
    ///
    /// Returns `false` without doing anything when the socket is not open.
    pub fn cancel(&self) -> bool {
        self.send_frame(ClientMessage::Cancel) == SendOutcome::Sent
    }

    fn send_frame(&self, frame: ClientMessage) -> SendOutcome {
        let mut notices = Vec::new();
        let outcome = {
            let mut state = self.inner.state.lock();
            let written = state.open_sender().map(|tx| write_frame(tx, &frame));
            match written {
                Some(Ok(())) => SendOutcome::Sent,
                Some(Err(err)) => {
                    notices.push(Notice::Error(err));
                    state.hold(frame)
                }
                None => state.hold(frame),
            }
        };
        self.inner.dispatch(notices);
        outcome
    }

    /// Register a handler for inbound frames
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.inner.message_listeners.subscribe(handler)
    }

    /// Register a handler for status changes
    ///
    /// The handler is called immediately with the current status.
    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let (current, subscription) = {
            let state = self.inner.state.lock();
            let registered = Arc::clone(&handler);
            let subscription = self
                .inner
                .status_listeners
                .subscribe(move |status| registered(status));
            (state.status, subscription)
        };
        handler(&current);
        subscription
    }

    /// Register a handler for transport errors
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.inner.error_listeners.subscribe(handler)
    }

    /// Current connection status
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Check if the socket is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Conversation the socket is bound to
    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.inner.state.lock().conversation_id.clone()
    }

    /// Messages waiting for the next connection
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Drop every queued message, returning how many there were
    pub fn discard_queued(&self) -> usize {
        let mut state = self.inner.state.lock();
        let count = state.queue.len();
        state.queue.clear();
        count
    }

    /// Reconnection attempts since the last successful connection
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    /// Heartbeat statistics for the open connection
    #[must_use]
    pub fn heartbeat_stats(&self) -> Option<HeartbeatStats> {
        let state = self.inner.state.lock();
        state
            .connection
            .as_ref()
            .and_then(|c| c.heartbeat.as_ref())
            .map(HeartbeatTracker::stats)
    }

    /// Transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ChatSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChatSocket")
            .field("status", &state.status)
            .field("conversation_id", &state.conversation_id)
            .field("queued", &state.queue.len())
            .field("reconnect_attempts", &state.reconnect_attempts)
            .finish()
    }
}

// ============================================================================
// State machine
// ============================================================================

impl SocketInner {
    fn dispatch(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Status(status) => self.status_listeners.emit(&status),
                Notice::Error(err) => self.error_listeners.emit(&err),
            }
        }
    }

    /// Start a connection attempt for the current conversation
    fn open_locked(self: &Arc<Self>, state: &mut SocketState, notices: &mut Vec<Notice>) {
        let Some(conversation_id) = state.conversation_id.clone() else {
            return;
        };

        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.connection = Some(Connection {
            cancel: cancel.clone(),
            outgoing: None,
            heartbeat: None,
        });
        state.set_status(ConnectionStatus::Connecting, notices);

        let url = self.config.chat_url(&conversation_id);
        tracing::debug!(
            conversation_id = %conversation_id,
            attempt = state.reconnect_attempts,
            url = %url,
            "Opening chat socket"
        );

        let weak = Arc::downgrade(self);
        let connector = Arc::clone(&self.connector);
        tokio::spawn(run_connection(weak, connector, generation, cancel, url));
    }

    fn handle_open(
        self: &Arc<Self>,
        generation: u64,
        outgoing: mpsc::UnboundedSender<OutboundFrame>,
    ) -> bool {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.connection.is_none() {
                return false;
            }

            let mut flushed = 0usize;
            while let Some(frame) = state.queue.pop_front() {
                if let Err(err) = write_frame(&outgoing, &frame) {
                    notices.push(Notice::Error(err));
                    state.queue.push_front(frame);
                    break;
                }
                flushed += 1;
            }

            let cancel = match state.connection.as_mut() {
                Some(connection) => {
                    connection.outgoing = Some(outgoing);
                    connection.heartbeat =
                        Some(HeartbeatTracker::new(self.config.heartbeat_interval));
                    connection.cancel.clone()
                }
                None => return false,
            };
            state.reconnect_attempts = 0;
            state.set_status(ConnectionStatus::Connected, &mut notices);

            tracing::info!(
                conversation_id = ?state.conversation_id,
                flushed,
                "Chat socket connected"
            );

            let weak = Arc::downgrade(self);
            tokio::spawn(run_heartbeat(
                weak,
                generation,
                cancel,
                self.config.heartbeat_interval,
            ));
        }
        self.dispatch(notices);
        true
    }

    fn handle_open_failure(self: &Arc<Self>, generation: u64, err: TransportError) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != ConnectionStatus::Connecting {
                return;
            }
            tracing::warn!(
                conversation_id = ?state.conversation_id,
                error = %err,
                "Chat socket failed to open"
            );
            state.connection = None;
            notices.push(Notice::Error(err));
            self.schedule_reconnect_locked(&mut state, &mut notices);
        }
        self.dispatch(notices);
    }

    fn handle_text(&self, generation: u64, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, frame_len = text.len(), "Dropping malformed frame");
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            if let ServerMessage::Pong { .. } = message {
                if let Some(tracker) = state
                    .connection
                    .as_mut()
                    .and_then(|c| c.heartbeat.as_mut())
                {
                    if let Some(rtt) = tracker.record_pong() {
                        tracing::trace!(rtt = ?rtt, "Pong received");
                    }
                }
            }
        }

        tracing::debug!(kind = message.kind(), "Frame received");
        self.message_listeners.emit(&message);
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation
                || !matches!(
                    state.status,
                    ConnectionStatus::Connecting | ConnectionStatus::Connected
                )
            {
                return;
            }

            if let Some(connection) = state.connection.take() {
                connection.cancel.cancel();
            }

            if is_intentional_close(code) && state.status == ConnectionStatus::Connected {
                tracing::info!(
                    conversation_id = ?state.conversation_id,
                    code,
                    "Chat socket closed"
                );
                state.set_status(ConnectionStatus::Disconnected, &mut notices);
            } else {
                tracing::warn!(
                    conversation_id = ?state.conversation_id,
                    code,
                    reason = %reason,
                    "Chat socket closed abnormally"
                );
                notices.push(Notice::Error(TransportError::ConnectionClosed { code, reason }));
                self.schedule_reconnect_locked(&mut state, &mut notices);
            }
        }
        self.dispatch(notices);
    }

    /// One heartbeat tick; returns `false` once the heartbeat should stop
    fn heartbeat_tick(self: &Arc<Self>, generation: u64) -> bool {
        let mut notices = Vec::new();
        let keep_running = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation || state.status != ConnectionStatus::Connected {
                return false;
            }
            let Some(connection) = state.connection.as_mut() else {
                return false;
            };
            let Some(tracker) = connection.heartbeat.as_mut() else {
                return false;
            };

            if tracker.is_expired() {
                let silence_ms = u64::try_from(tracker.silence().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    conversation_id = ?state.conversation_id,
                    silence_ms,
                    "Heartbeat timeout, closing chat socket"
                );
                if let Some(connection) = state.connection.take() {
                    connection.shutdown(HEARTBEAT_CLOSE_CODE, "heartbeat timeout");
                }
                notices.push(Notice::Error(TransportError::HeartbeatTimeout { silence_ms }));
                self.schedule_reconnect_locked(state, &mut notices);
                false
            } else {
                tracker.record_ping();
                match connection.outgoing.as_ref().map(|tx| write_frame(tx, &ClientMessage::Ping)) {
                    Some(Err(err)) => notices.push(Notice::Error(err)),
                    Some(Ok(())) => tracing::trace!("Ping sent"),
                    None => {}
                }
                true
            }
        };
        self.dispatch(notices);
        keep_running
    }

    /// Move to `Reconnecting` with a backoff timer, or to `Failed`
    fn schedule_reconnect_locked(self: &Arc<Self>, state: &mut SocketState, notices: &mut Vec<Notice>) {
        state.cancel_reconnect_timer();

        if !self.config.reconnect_enabled {
            tracing::info!("Reconnection disabled");
            state.set_status(ConnectionStatus::Failed, notices);
            return;
        }

        if state.reconnect_attempts >= self.config.max_reconnect_attempts {
            tracing::error!(
                conversation_id = ?state.conversation_id,
                attempts = state.reconnect_attempts,
                "Max reconnection attempts reached"
            );
            state.set_status(ConnectionStatus::Failed, notices);
            notices.push(Notice::Error(TransportError::ReconnectExhausted {
                attempts: state.reconnect_attempts,
            }));
            return;
        }

        let delay = self.config.reconnect_delay(state.reconnect_attempts);
        state.reconnect_attempts += 1;
        state.set_status(ConnectionStatus::Reconnecting, notices);

        tracing::info!(
            conversation_id = ?state.conversation_id,
            attempt = state.reconnect_attempts,
            max_attempts = self.config.max_reconnect_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnection"
        );

        let timer = CancellationToken::new();
        state.reconnect_timer = Some(timer.clone());
        let generation = state.generation;
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.fire_reconnect(generation);
            }
        });
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != ConnectionStatus::Reconnecting {
                return;
            }
            state.reconnect_timer = None;
            self.open_locked(&mut state, &mut notices);
        }
        self.dispatch(notices);
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.state.get_mut().teardown(CLOSE_NORMAL, "client dropped");
    }
}

fn write_frame(
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    frame: &ClientMessage,
) -> Result<(), TransportError> {
    let text =
        serde_json::to_string(frame).map_err(|e| TransportError::Serialization(e.to_string()))?;
    tx.send(OutboundFrame::Text(text))
        .map_err(|_| TransportError::SendFailed("socket writer closed".to_string()))
}

// ============================================================================
// Background tasks
// ============================================================================

async fn run_connection(
    weak: Weak<SocketInner>,
    connector: Arc<dyn SocketConnector>,
    generation: u64,
    cancel: CancellationToken,
    url: String,
) {
    let opened = tokio::select! {
        () = cancel.cancelled() => return,
        result = connector.open(&url) => result,
    };

    let mut incoming = match opened {
        Ok(channels) => {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let outgoing = channels.outgoing.clone();
            if !inner.handle_open(generation, channels.outgoing) {
                let _ = outgoing.send(OutboundFrame::Close {
                    code: CLOSE_NORMAL,
                    reason: "superseded".to_string(),
                });
                return;
            }
            channels.incoming
        }
        Err(err) => {
            if let Some(inner) = weak.upgrade() {
                inner.handle_open_failure(generation, err);
            }
            return;
        }
    };

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = incoming.recv() => event,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };

        match event {
            Some(SocketEvent::Text(text)) => inner.handle_text(generation, &text),
            Some(SocketEvent::Closed { code, reason }) => {
                inner.handle_close(generation, code, reason);
                return;
            }
            None => {
                inner.handle_close(generation, CLOSE_ABNORMAL, String::new());
                return;
            }
        }
    }
}

async fn run_heartbeat(
    weak: Weak<SocketInner>,
    generation: u64,
    cancel: CancellationToken,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.heartbeat_tick(generation) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::transport::mock::{settle, MockConnector, MockPeer, OpenOutcome};

    fn record_statuses(socket: &ChatSocket) -> (Arc<Mutex<Vec<ConnectionStatus>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = socket.on_status_change(move |s| sink.lock().push(*s));
        (seen, sub)
    }

    fn record_errors(socket: &ChatSocket) -> (Arc<Mutex<Vec<TransportError>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = socket.on_error(move |e| sink.lock().push(e.clone()));
        (seen, sub)
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
        settle().await;
        peers.try_recv().expect("connector was not asked to open a socket")
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_replayed_on_subscribe() {
        let (connector, _peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);

        let (seen, _sub) = record_statuses(&socket);
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_during_replay_reaches_new_handler() {
        let (connector, _peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let trigger = socket.clone();
        let _sub = socket.on_status_change(move |s| {
            sink.lock().push(*s);
            if *s == ConnectionStatus::Disconnected {
                trigger.connect("conv-1");
            }
        });
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_for_same_conversation() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);
        let (seen, _sub) = record_statuses(&socket);

        socket.connect("conv-1");
        let peer = next_peer(&mut peers).await;
        assert!(peer.url.ends_with("/ws/chat/conv-1"));
        assert_eq!(socket.status(), ConnectionStatus::Connected);

        socket.connect("conv-1");
        settle().await;

        assert_eq!(connector.opens(), 1);
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_conversation_closes_previous_socket() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);

        socket.connect("conv-1");
        let mut first = next_peer(&mut peers).await;

        socket.connect("conv-2");
        let second = next_peer(&mut peers).await;

        assert!(second.url.ends_with("/ws/chat/conv-2"));
        assert_eq!(connector.opens(), 2);
        assert_eq!(socket.conversation_id().as_deref(), Some("conv-2"));
        assert_eq!(socket.status(), ConnectionStatus::Connected);

        let frames = first.drain();
        assert!(matches!(
            frames.last(),
            Some(OutboundFrame::Close { code: 1000, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_flushes_in_order_on_connect() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);

        assert_eq!(socket.send_message("first", None), SendOutcome::Queued);
        assert_eq!(socket.send_message("second", None), SendOutcome::Queued);
        assert_eq!(socket.send_message("third", None), SendOutcome::Queued);
        assert_eq!(socket.queued_messages(), 3);

        socket.connect("conv-1");
        let mut peer = next_peer(&mut peers).await;
        assert_eq!(socket.queued_messages(), 0);

        assert_eq!(socket.send_message("fourth", None), SendOutcome::Sent);

        let contents: Vec<String> = peer
            .drain_json()
            .into_iter()
            .filter(|v| v["type"] == "message")
            .map(|v| v["content"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third", "fourth"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_ping_are_not_queued() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);

        assert!(!socket.cancel());
        assert_eq!(socket.queued_messages(), 0);

        socket.connect("conv-1");
        let mut peer = next_peer(&mut peers).await;
        assert!(peer.drain().is_empty());

        assert!(socket.cancel());
        assert_eq!(peer.drain_json(), vec![json!({"type": "cancel"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_until_attempts_exhausted() {
        let (connector, _peers) = MockConnector::refusing();
        let config = TransportConfig::for_testing()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(250));
        let socket = ChatSocket::with_connector(config, Arc::clone(&connector) as _);
        let (errors, _sub) = record_errors(&socket);

        socket.connect("conv-1");
        settle().await;
        assert_eq!(connector.opens(), 1);
        assert_eq!(socket.status(), ConnectionStatus::Reconnecting);

        // attempt 1 after 100ms
        tokio::time::sleep(Duration::from_millis(98)).await;
        assert_eq!(connector.opens(), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(connector.opens(), 2);

        // attempt 2 after 200ms
        tokio::time::sleep(Duration::from_millis(198)).await;
        assert_eq!(connector.opens(), 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(connector.opens(), 3);

        // attempt 3 capped at 250ms
        tokio::time::sleep(Duration::from_millis(248)).await;
        assert_eq!(connector.opens(), 3);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(connector.opens(), 4);

        assert_eq!(socket.status(), ConnectionStatus::Failed);
        assert_eq!(
            errors.lock().last(),
            Some(&TransportError::ReconnectExhausted { attempts: 3 })
        );

        // no timer left behind
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens(), 4);
        assert_eq!(socket.status(), ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_from_failed_starts_over() {
        let (connector, mut peers) = MockConnector::accepting();
        connector.script(&[OpenOutcome::Refuse]);
        let config = TransportConfig::for_testing().with_reconnect(false);
        let socket = ChatSocket::with_connector(config, Arc::clone(&connector) as _);

        socket.connect("conv-1");
        settle().await;
        assert_eq!(socket.status(), ConnectionStatus::Failed);

        socket.connect("conv-1");
        let _peer = next_peer(&mut peers).await;
        assert_eq!(socket.status(), ConnectionStatus::Connected);
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_and_resets_attempts() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);
        let (seen, _sub) = record_statuses(&socket);
        let (errors, _esub) = record_errors(&socket);

        socket.connect("conv-1");
        let first = next_peer(&mut peers).await;

        first.close(1011);
        settle().await;
        assert_eq!(socket.status(), ConnectionStatus::Reconnecting);
        assert_eq!(socket.reconnect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _second = next_peer(&mut peers).await;
        assert_eq!(socket.status(), ConnectionStatus::Connected);
        assert_eq!(socket.reconnect_attempts(), 0);

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
        assert!(matches!(
            errors.lock().first(),
            Some(TransportError::ConnectionClosed { code: 1011, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_does_not_reconnect() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);

        socket.connect("conv-1");
        let peer = next_peer(&mut peers).await;

        peer.close(1000);
        settle().await;
        assert_eq!(socket.status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_forces_close_and_reconnect() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);
        let (seen, _sub) = record_statuses(&socket);
        let (errors, _esub) = record_errors(&socket);

        socket.connect("conv-1");
        let mut peer = next_peer(&mut peers).await;

        // heartbeat 500ms: pings at 500 and 1000, silence exceeds 1000ms at 1500
        tokio::time::sleep(Duration::from_millis(1550)).await;

        let frames = peer.drain();
        let pings = frames
            .iter()
            .filter(|f| matches!(f, OutboundFrame::Text(t) if t.contains("ping")))
            .count();
        assert_eq!(pings, 2);
        assert!(matches!(
            frames.last(),
            Some(OutboundFrame::Close { code: 4000, .. })
        ));
        assert!(seen.lock().contains(&ConnectionStatus::Reconnecting));
        assert!(matches!(
            errors.lock().first(),
            Some(TransportError::HeartbeatTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_connection_alive() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);
        let (seen, _sub) = record_statuses(&socket);

        socket.connect("conv-1");
        let peer = next_peer(&mut peers).await;
        let _responder = peer.answer_pings();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(socket.status(), ConnectionStatus::Connected);
        assert!(!seen.lock().contains(&ConnectionStatus::Reconnecting));
        assert_eq!(connector.opens(), 1);

        let stats = socket.heartbeat_stats().unwrap();
        assert!(stats.pings_sent >= 9);
        assert_eq!(stats.pongs_received, stats.pings_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _sub = socket.on_message(move |m| sink.lock().push(m.clone()));

        socket.connect("conv-1");
        let peer = next_peer(&mut peers).await;

        peer.send_text("{not json");
        peer.send_json(&json!({"type": "text", "content": "Hel"}));
        settle().await;

        assert_eq!(
            *received.lock(),
            vec![ServerMessage::Text {
                content: "Hel".into(),
                message_id: None
            }]
        );
        assert_eq!(socket.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_listener_stops_receiving() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket = ChatSocket::with_connector(TransportConfig::for_testing(), connector);

        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let sub = socket.on_message(move |_| *sink.lock() += 1);

        socket.connect("conv-1");
        let peer = next_peer(&mut peers).await;

        peer.send_json(&json!({"type": "text", "content": "a"}));
        settle().await;
        sub.unsubscribe();
        peer.send_json(&json!({"type": "text", "content": "b"}));
        settle().await;

        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_state() {
        let (connector, mut peers) = MockConnector::accepting();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);

        socket.connect("conv-1");
        let mut peer = next_peer(&mut peers).await;

        socket.disconnect();
        settle().await;

        assert_eq!(socket.status(), ConnectionStatus::Disconnected);
        assert_eq!(socket.conversation_id(), None);
        assert!(matches!(
            peer.drain().last(),
            Some(OutboundFrame::Close { code: 1000, .. })
        ));

        // queued while disconnected, then dropped by the next disconnect
        socket.send_message("later", None);
        socket.disconnect();
        assert_eq!(socket.queued_messages(), 0);

        // no reconnection happens after an explicit disconnect
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (connector, _peers) = MockConnector::refusing();
        let socket =
            ChatSocket::with_connector(TransportConfig::for_testing(), Arc::clone(&connector) as _);

        socket.connect("conv-1");
        settle().await;
        assert_eq!(socket.status(), ConnectionStatus::Reconnecting);

        socket.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connector.opens(), 1);
        assert_eq!(socket.status(), ConnectionStatus::Disconnected);
    }
}
