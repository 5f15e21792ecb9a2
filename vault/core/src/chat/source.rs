//! Response Sources
//!
//! Where the chat controller gets the events of one assistant turn from.
//! [`SocketResponseSource`] sends the user message over the chat socket and
//! yields the frames that come back until `done` or `error`. Frames still
//! arriving for a cancelled turn are discarded rather than handed to the
//! next one.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::stream::BoxStream;
use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::listeners::Subscription;
use crate::protocol::{ChatContext, ServerMessage};
use crate::transport::{ChatSocket, ConnectionStatus, SendOutcome};

/// Application-level failure of a turn
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The connection went away while the turn was in flight
    #[error("Connection lost ({0})")]
    ConnectionLost(ConnectionStatus),

    /// The event stream ended without `done`
    #[error("Response ended unexpectedly")]
    Ended,
}

/// One user message to be answered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRequest {
    /// Conversation the message belongs to
    pub conversation_id: Option<String>,
    /// Trimmed message text
    pub content: String,
    /// Retrieval context
    pub context: ChatContext,
}

/// Stream of events for one turn
pub type TurnEvents = BoxStream<'static, Result<ServerMessage, StreamError>>;

/// Produces the events of assistant turns
pub trait ResponseSource: Send + Sync {
    /// Start a turn and stream its events
    fn stream(&self, request: TurnRequest) -> TurnEvents;

    /// Ask the producer to stop the current turn
    fn cancel(&self);
}

/// Where inbound frames currently go
#[derive(Default)]
struct Routing {
    /// Sink of the turn in flight
    turn: Option<mpsc::UnboundedSender<Result<ServerMessage, StreamError>>>,
    /// Terminal frames still owed by abandoned turns
    stale: usize,
}

impl Routing {
    fn route(&mut self, frame: &ServerMessage) {
        if matches!(frame, ServerMessage::Pong { .. }) {
            return;
        }
        if self.stale > 0 {
            if frame.is_terminal() {
                self.stale -= 1;
            }
            tracing::debug!(
                kind = frame.kind(),
                stale = self.stale,
                "Dropping frame of an abandoned turn"
            );
            return;
        }
        if let Some(turn) = &self.turn {
            let _ = turn.send(Ok(frame.clone()));
        }
    }
}

/// Response source backed by the chat socket
///
/// Frames are routed to the turn in flight. A turn dropped before its
/// terminal frame leaves a debt: everything up to the next `done` or `error`
/// belongs to it and is discarded. The debt goes away with the connection
/// that carried it.
#[derive(Clone)]
pub struct SocketResponseSource {
    socket: ChatSocket,
    routing: Arc<Mutex<Routing>>,
}

impl SocketResponseSource {
    /// Wrap a chat socket
    ///
    /// The routing handlers stay registered for the lifetime of the socket.
    #[must_use]
    pub fn new(socket: ChatSocket) -> Self {
        let routing = Arc::new(Mutex::new(Routing::default()));

        let frames = Arc::clone(&routing);
        let _frames = socket.on_message(move |frame| frames.lock().route(frame));

        let lost = Arc::clone(&routing);
        let _lost = socket.on_status_change(move |status| {
            if !status.is_connected() && *status != ConnectionStatus::Connecting {
                lost.lock().stale = 0;
            }
        });

        Self { socket, routing }
    }

    /// Responses still owed by abandoned turns
    #[must_use]
    pub fn stale_turns(&self) -> usize {
        self.routing.lock().stale
    }
}

impl std::fmt::Debug for SocketResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketResponseSource")
            .field("socket", &self.socket)
            .field("stale", &self.routing.lock().stale)
            .finish()
    }
}

impl ResponseSource for SocketResponseSource {
    fn stream(&self, request: TurnRequest) -> TurnEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routing.lock().turn = Some(tx.clone());

        // The replayed current status only arms the watcher
        let armed = Arc::new(AtomicBool::new(false));
        let was_connected = Arc::new(AtomicBool::new(false));
        let watcher = {
            let armed = Arc::clone(&armed);
            let was_connected = Arc::clone(&was_connected);
            let tx = tx.clone();
            self.socket.on_status_change(move |status| {
                if status.is_connected() {
                    was_connected.store(true, Ordering::SeqCst);
                    return;
                }
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                let lost = matches!(
                    status,
                    ConnectionStatus::Failed | ConnectionStatus::Disconnected
                ) || was_connected.load(Ordering::SeqCst);
                if lost {
                    let _ = tx.send(Err(StreamError::ConnectionLost(*status)));
                }
            })
        };
        armed.store(true, Ordering::SeqCst);

        // Nothing will carry the message: the socket gave up, or the server
        // closed a bound conversation and no reconnection is scheduled
        let status = self.socket.status();
        let dead = status == ConnectionStatus::Failed
            || (status == ConnectionStatus::Disconnected
                && self.socket.conversation_id().is_some());
        let submitted = if dead {
            tracing::warn!(
                conversation_id = ?request.conversation_id,
                status = %status,
                "Chat socket unavailable, not sending message"
            );
            let _ = tx.send(Err(StreamError::ConnectionLost(status)));
            None
        } else {
            let outcome = self
                .socket
                .send_message(request.content, Some(request.context));
            tracing::debug!(
                conversation_id = ?request.conversation_id,
                outcome = ?outcome,
                "Chat message submitted"
            );
            Some(outcome)
        };

        Box::pin(TurnStream {
            events: UnboundedReceiverStream::new(rx),
            socket: self.socket.clone(),
            routing: Arc::clone(&self.routing),
            watcher: Some(watcher),
            submitted,
            state: TurnState::Open,
        })
    }

    fn cancel(&self) {
        if !self.socket.cancel() {
            tracing::debug!("Cancel not sent, socket is not connected");
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Open,
    /// Ended with a terminal frame
    Answered,
    /// Ended without one; the connection is gone or never carried the turn
    Abandoned,
}

/// Turn events, ending after the first terminal frame or failure
struct TurnStream {
    events: UnboundedReceiverStream<Result<ServerMessage, StreamError>>,
    socket: ChatSocket,
    routing: Arc<Mutex<Routing>>,
    watcher: Option<Subscription>,
    submitted: Option<SendOutcome>,
    state: TurnState,
}

impl TurnStream {
    fn release(&mut self, state: TurnState) {
        self.state = state;
        if let Some(watcher) = self.watcher.take() {
            watcher.unsubscribe();
        }
        self.routing.lock().turn = None;
    }
}

impl Stream for TurnStream {
    type Item = Result<ServerMessage, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state != TurnState::Open {
            return Poll::Ready(None);
        }

        let item = ready!(Pin::new(&mut self.events).poll_next(cx));
        match &item {
            Some(Ok(frame)) if !frame.is_terminal() => {}
            Some(Ok(_)) => self.release(TurnState::Answered),
            Some(Err(_)) | None => self.release(TurnState::Abandoned),
        }
        Poll::Ready(item)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if self.state != TurnState::Open {
            return;
        }
        self.release(TurnState::Abandoned);

        // The end may already be buffered, unread
        let events = self.events.as_mut();
        let ended = std::iter::from_fn(|| events.try_recv().ok()).any(|item| match item {
            Ok(frame) => frame.is_terminal(),
            Err(_) => true,
        });
        if ended {
            return;
        }

        match self.submitted {
            Some(SendOutcome::Queued) if self.socket.queued_messages() > 0 => {
                let discarded = self.socket.discard_queued();
                tracing::debug!(discarded, "Turn dropped before its message left the queue");
            }
            Some(SendOutcome::Sent | SendOutcome::Queued) if self.socket.is_connected() => {
                let mut routing = self.routing.lock();
                routing.stale += 1;
                tracing::debug!(stale = routing.stale, "Turn dropped before its response ended");
            }
            _ => {}
        }
    }
}
