//! Chat Session Controller
//!
//! Turns the event stream of a [`ResponseSource`] into conversation state.
//! One turn at a time:
//!
//! 1. `send_message` appends the user message and an empty, streaming
//!    assistant placeholder
//! 2. each event is applied to the placeholder in arrival order
//!    (`text` appends, `tool_use_start` adds a running [`ToolCall`],
//!    `tool_result` / `tool_use_end` resolve it)
//! 3. `done` attaches document references and completes the turn; `error`
//!    (or a source failure) replaces the content with [`APOLOGY`]
//!
//! Cancellation goes through a per-turn [`CancellationToken`]: the turn loop
//! checks it before applying every event, so nothing arrives after a cancel
//! and the partial content stays as it was.
//!
//! Front-ends follow along through [`ChatSession::subscribe`].

pub mod message;
pub mod source;

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::listeners::{ListenerSet, Subscription};
use crate::protocol::{ChatContext, DocumentReference, ServerMessage};

pub use message::{Message, MessageId, Role, ToolCall, ToolStatus};
pub use source::{ResponseSource, SocketResponseSource, StreamError, TurnEvents, TurnRequest};

/// Assistant content shown when a turn fails
pub const APOLOGY: &str = "Sorry, I encountered an error while processing your request. Please try again.";

/// How a `send_message` call ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Blank input, or a turn was already in flight
    Ignored,
    /// `done` received
    Completed,
    /// Error frame or source failure; content replaced by [`APOLOGY`]
    Failed,
    /// Cancelled by the user (or by clearing the conversation)
    Cancelled,
}

/// Change notifications for front-ends
#[derive(Clone, Debug, PartialEq)]
pub enum ChatUpdate {
    /// A message was added
    MessageAppended(Message),
    /// Text was appended to a streaming message
    ContentDelta {
        /// Message being streamed
        id: MessageId,
        /// Appended text
        delta: String,
    },
    /// A tool call was added or resolved
    ToolCallChanged {
        /// Message owning the call
        id: MessageId,
        /// Current state of the call
        call: ToolCall,
    },
    /// A turn ended
    TurnFinished {
        /// Assistant message of the turn
        id: MessageId,
        /// How it ended
        outcome: TurnOutcome,
        /// Final assistant message, unless it was cleared
        message: Option<Message>,
    },
    /// The conversation was reset
    Cleared,
}

struct ActiveTurn {
    assistant_id: MessageId,
    cancel: CancellationToken,
}

struct ChatState {
    conversation_id: Option<String>,
    context: ChatContext,
    messages: Vec<Message>,
    active: Option<ActiveTurn>,
    next_tool_seq: u64,
}

impl ChatState {
    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// What applying one event did to the turn
enum Applied {
    Continue,
    Completed,
    Failed,
    Cancelled,
}

/// Releases the turn when `send_message` is dropped before it returns
struct TurnGuard<'a> {
    session: &'a ChatSession,
    id: MessageId,
    cancel: CancellationToken,
    armed: bool,
}

impl TurnGuard<'_> {
    fn finish(mut self, outcome: TurnOutcome) {
        self.armed = false;
        self.session.finish(self.id, outcome);
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(message_id = %self.id, "Assistant turn abandoned");
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.session.inner.source.cancel();
        }
        self.session.finish(self.id, TurnOutcome::Cancelled);
    }
}

struct ChatInner {
    source: Arc<dyn ResponseSource>,
    state: Mutex<ChatState>,
    listeners: ListenerSet<ChatUpdate>,
}

/// Streaming chat controller
///
/// Cheap to clone; clones share the conversation.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<ChatInner>,
}

impl ChatSession {
    /// Create a controller reading turns from `source`
    #[must_use]
    pub fn new(source: Arc<dyn ResponseSource>) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                source,
                state: Mutex::new(ChatState {
                    conversation_id: None,
                    context: ChatContext::global(),
                    messages: Vec::new(),
                    active: None,
                    next_tool_seq: 1,
                }),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Send a user message and drive the assistant turn to its end
    ///
    /// Returns [`TurnOutcome::Ignored`] for blank input or while another
    /// turn is in flight.
    pub async fn send_message(&self, content: &str) -> TurnOutcome {
        let content = content.trim();
        if content.is_empty() {
            return TurnOutcome::Ignored;
        }

        let (request, assistant_id, cancel, appended) = {
            let mut state = self.inner.state.lock();
            if state.active.is_some() {
                tracing::debug!("Turn already in flight, ignoring message");
                return TurnOutcome::Ignored;
            }

            let user = Message::user(state.conversation_id.clone(), content);
            let assistant = Message::assistant_placeholder(state.conversation_id.clone());
            let assistant_id = assistant.id;
            let cancel = CancellationToken::new();

            state.active = Some(ActiveTurn {
                assistant_id,
                cancel: cancel.clone(),
            });
            state.messages.push(user.clone());
            state.messages.push(assistant.clone());

            let request = TurnRequest {
                conversation_id: state.conversation_id.clone(),
                content: content.to_string(),
                context: state.context.clone(),
            };
            (request, assistant_id, cancel, [user, assistant])
        };

        for message in appended {
            self.inner.listeners.emit(&ChatUpdate::MessageAppended(message));
        }

        tracing::info!(
            conversation_id = ?request.conversation_id,
            message_id = %assistant_id,
            "Starting assistant turn"
        );

        let guard = TurnGuard {
            session: self,
            id: assistant_id,
            cancel: cancel.clone(),
            armed: true,
        };
        let mut events = self.inner.source.stream(request);
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break TurnOutcome::Cancelled,
                next = events.next() => next,
            };

            let applied = match next {
                Some(Ok(frame)) => self.apply(assistant_id, &cancel, frame),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "Assistant turn failed");
                    self.fail(assistant_id, &cancel)
                }
                None => {
                    tracing::warn!(error = %StreamError::Ended, "Assistant turn failed");
                    self.fail(assistant_id, &cancel)
                }
            };

            match applied {
                Applied::Continue => {}
                Applied::Completed => break TurnOutcome::Completed,
                Applied::Failed => break TurnOutcome::Failed,
                Applied::Cancelled => break TurnOutcome::Cancelled,
            }
        };
        drop(events);

        guard.finish(outcome);
        outcome
    }

    /// Apply one event to the assistant message
    fn apply(&self, id: MessageId, cancel: &CancellationToken, frame: ServerMessage) -> Applied {
        let mut updates = Vec::new();
        let applied = {
            let mut guard = self.inner.state.lock();
            if cancel.is_cancelled() {
                return Applied::Cancelled;
            }
            let state = &mut *guard;
            let seq = &mut state.next_tool_seq;
            let Some(message) = state.messages.iter_mut().find(|m| m.id == id) else {
                return Applied::Cancelled;
            };

            match frame {
                ServerMessage::Text { content, .. } => {
                    message.content.push_str(&content);
                    updates.push(ChatUpdate::ContentDelta { id, delta: content });
                    Applied::Continue
                }
                ServerMessage::ToolUseStart {
                    tool_id,
                    tool_name,
                    input,
                } => {
                    let call_id = tool_id.unwrap_or_else(|| {
                        let generated = format!("tool-{seq}");
                        *seq += 1;
                        generated
                    });
                    tracing::debug!(tool = %tool_name, call_id = %call_id, "Tool started");
                    let call = ToolCall::running(call_id, tool_name, input);
                    message.tool_calls.push(call.clone());
                    updates.push(ChatUpdate::ToolCallChanged { id, call });
                    Applied::Continue
                }
                ServerMessage::ToolResult {
                    tool_id,
                    tool_name,
                    result,
                    duration,
                    error,
                } => {
                    match message.find_running_call(tool_id.as_deref(), tool_name.as_deref()) {
                        Some(call) => {
                            let result = (!result.is_null()).then_some(result);
                            call.resolve(result, error, duration);
                            tracing::debug!(
                                tool = %call.name,
                                status = ?call.status,
                                duration_ms = ?call.duration_ms,
                                "Tool finished"
                            );
                            updates.push(ChatUpdate::ToolCallChanged {
                                id,
                                call: call.clone(),
                            });
                        }
                        None => tracing::debug!(
                            tool_id = ?tool_id,
                            tool_name = ?tool_name,
                            "Dropping unmatched tool result"
                        ),
                    }
                    Applied::Continue
                }
                ServerMessage::ToolUseEnd { tool_id, tool_name } => {
                    if let Some(call) =
                        message.find_running_call(tool_id.as_deref(), tool_name.as_deref())
                    {
                        call.resolve(None, None, None);
                        updates.push(ChatUpdate::ToolCallChanged {
                            id,
                            call: call.clone(),
                        });
                    }
                    Applied::Continue
                }
                ServerMessage::Done {
                    message_id,
                    document_references,
                } => {
                    message.server_id = message_id;
                    message.document_references =
                        collect_references(&message.tool_calls, document_references);
                    Applied::Completed
                }
                ServerMessage::Error { error } => {
                    tracing::warn!(error = %error, "Server reported a turn error");
                    message.content = APOLOGY.to_string();
                    Applied::Failed
                }
                ServerMessage::Pong { .. } => Applied::Continue,
            }
        };

        for update in &updates {
            self.inner.listeners.emit(update);
        }
        applied
    }

    fn fail(&self, id: MessageId, cancel: &CancellationToken) -> Applied {
        let mut state = self.inner.state.lock();
        if cancel.is_cancelled() {
            return Applied::Cancelled;
        }
        if let Some(message) = state.message_mut(id) {
            message.content = APOLOGY.to_string();
        }
        Applied::Failed
    }

    /// Freeze the assistant message and release the turn
    fn finish(&self, id: MessageId, outcome: TurnOutcome) {
        let message = {
            let mut state = self.inner.state.lock();
            if state.active.as_ref().is_some_and(|t| t.assistant_id == id) {
                state.active = None;
            }
            state.message_mut(id).map(|m| {
                m.is_streaming = false;
                m.clone()
            })
        };

        tracing::info!(message_id = %id, outcome = ?outcome, "Assistant turn finished");
        self.inner.listeners.emit(&ChatUpdate::TurnFinished {
            id,
            outcome,
            message,
        });
    }

    /// Stop the in-flight turn, keeping whatever content already arrived
    ///
    /// Returns `false` when no turn is in flight.
    pub fn cancel_generation(&self) -> bool {
        let cancelled = {
            let state = self.inner.state.lock();
            match &state.active {
                Some(turn) => {
                    turn.cancel.cancel();
                    true
                }
                None => false,
            }
        };

        if cancelled {
            tracing::info!("Cancelling assistant turn");
            self.inner.source.cancel();
        }
        cancelled
    }

    /// Remove every message, cancelling any in-flight turn
    pub fn clear_messages(&self) {
        let had_turn = {
            let mut state = self.inner.state.lock();
            let active = state.active.take();
            if let Some(turn) = &active {
                turn.cancel.cancel();
            }
            state.messages.clear();
            active.is_some()
        };

        if had_turn {
            self.inner.source.cancel();
        }
        self.inner.listeners.emit(&ChatUpdate::Cleared);
    }

    /// Bind the session to a conversation, clearing the current messages
    pub fn set_conversation(&self, conversation_id: Option<String>) {
        self.clear_messages();
        self.inner.state.lock().conversation_id = conversation_id;
    }

    /// Replace the retrieval context for future messages
    pub fn set_context(&self, context: ChatContext) {
        self.inner.state.lock().context = context;
    }

    /// Register for conversation changes
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChatUpdate) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(handler)
    }

    /// Snapshot of the conversation
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().messages.clone()
    }

    /// Whether a turn is in flight
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    /// Conversation the session is bound to
    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.inner.state.lock().conversation_id.clone()
    }

    /// Current retrieval context
    #[must_use]
    pub fn context(&self) -> ChatContext {
        self.inner.state.lock().context.clone()
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChatSession")
            .field("conversation_id", &state.conversation_id)
            .field("messages", &state.messages.len())
            .field("streaming", &state.active.is_some())
            .finish()
    }
}

// ============================================================================
// Document references
// ============================================================================

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn reference_from(value: &Value) -> Option<DocumentReference> {
    Some(DocumentReference {
        repo: str_field(value, &["repo", "repository", "repoName"])?.to_string(),
        path: str_field(value, &["path"])?.to_string(),
        title: str_field(value, &["title", "name"]).map(str::to_string),
    })
}

/// Documents referenced by successful documentation tool calls
///
/// `get_documentation` contributes the document it fetched;
/// `search_documentation` contributes every hit. Explicit references from
/// the `done` frame come last. Duplicates (same repo and path) are dropped.
fn collect_references(
    calls: &[ToolCall],
    explicit: Vec<DocumentReference>,
) -> Vec<DocumentReference> {
    let mut found = Vec::new();

    for call in calls.iter().filter(|c| c.status == ToolStatus::Success) {
        match call.name.as_str() {
            "get_documentation" => {
                let from_input = call
                    .input
                    .as_ref()
                    .and_then(|input| reference_from(&Value::Object(input.clone())));
                let from_result = call.result.as_ref().and_then(reference_from);
                if let Some(reference) = from_input.or(from_result) {
                    found.push(reference);
                }
            }
            "search_documentation" => {
                let hits = call.result.as_ref().and_then(|r| {
                    r.as_array()
                        .or_else(|| r.get("results").and_then(Value::as_array))
                });
                found.extend(hits.into_iter().flatten().filter_map(reference_from));
            }
            _ => {}
        }
    }
    found.extend(explicit);

    let mut seen = HashSet::new();
    found.retain(|r| seen.insert((r.repo.clone(), r.path.clone())));
    found
}
