//! Chat Messages
//!
//! Front-end facing message model. The assistant message of the current
//! turn is mutated in place while it streams and frozen once the turn ends.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::DocumentReference;

/// Client-side message identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who wrote a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person using the portal
    User,
    /// The AI assistant
    Assistant,
}

/// Lifecycle of a tool invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Announced, not started
    Pending,
    /// Executing
    Running,
    /// Finished successfully
    Success,
    /// Finished with an error
    Error,
}

impl ToolStatus {
    /// Whether the call has been resolved
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// A tool invocation made by the assistant during a turn
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool invocation id
    pub id: String,
    /// Tool name
    pub name: String,
    /// Current status
    pub status: ToolStatus,
    /// Input arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    /// Tool output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl ToolCall {
    /// A call that just started running
    #[must_use]
    pub fn running(id: impl Into<String>, name: impl Into<String>, input: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ToolStatus::Running,
            input: (!input.is_empty()).then_some(input),
            result: None,
            error: None,
            duration_ms: None,
            started_at: Some(Instant::now()),
        }
    }

    /// Milliseconds since the call started
    #[must_use]
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.started_at
            .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    /// Resolve the call; later resolutions are ignored
    pub(crate) fn resolve(
        &mut self,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) {
        if self.status.is_finished() {
            return;
        }
        self.status = if error.is_some() {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        self.result = result;
        self.error = error;
        self.duration_ms = duration_ms.or_else(|| self.elapsed_ms());
    }
}

/// One entry of the conversation
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Client-side id
    pub id: MessageId,
    /// Conversation the message belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Author
    pub role: Role,
    /// Text content
    pub content: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Tool invocations, in start order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Documents the answer drew on
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub document_references: Vec<DocumentReference>,
    /// Still receiving content
    pub is_streaming: bool,
    /// Id the server assigned on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl Message {
    /// A user message
    #[must_use]
    pub fn user(conversation_id: Option<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content.into(), false)
    }

    /// An empty, streaming assistant placeholder
    #[must_use]
    pub fn assistant_placeholder(conversation_id: Option<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, String::new(), true)
    }

    fn new(conversation_id: Option<String>, role: Role, content: String, is_streaming: bool) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content,
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            document_references: Vec::new(),
            is_streaming,
            server_id: None,
        }
    }

    /// Running call matching a result or end frame
    ///
    /// Matches by id first; falls back to the most recent running call with
    /// the same name.
    pub(crate) fn find_running_call(
        &mut self,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Option<&mut ToolCall> {
        let by_id = id.and_then(|id| {
            self.tool_calls
                .iter()
                .position(|c| c.id == id && !c.status.is_finished())
        });
        let index = by_id.or_else(|| {
            let name = name?;
            self.tool_calls
                .iter()
                .rposition(|c| c.name == name && !c.status.is_finished())
        })?;
        self.tool_calls.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_with_calls() -> Message {
        let mut msg = Message::assistant_placeholder(None);
        msg.tool_calls.push(ToolCall::running("a", "search_documentation", Map::new()));
        msg.tool_calls.push(ToolCall::running("b", "search_documentation", Map::new()));
        msg
    }

    #[test]
    fn test_find_by_id_first() {
        let mut msg = message_with_calls();
        let call = msg.find_running_call(Some("a"), Some("search_documentation")).unwrap();
        assert_eq!(call.id, "a");
    }

    #[test]
    fn test_find_falls_back_to_latest_by_name() {
        let mut msg = message_with_calls();
        let call = msg.find_running_call(None, Some("search_documentation")).unwrap();
        assert_eq!(call.id, "b");

        assert!(msg.find_running_call(Some("zzz"), Some("get_documentation")).is_none());
    }

    #[test]
    fn test_resolve_only_once() {
        let mut call = ToolCall::running("a", "get_documentation", Map::new());
        call.resolve(Some(json!({"ok": true})), None, Some(12));
        call.resolve(None, Some("late".into()), Some(99));

        assert_eq!(call.status, ToolStatus::Success);
        assert_eq!(call.duration_ms, Some(12));
        assert_eq!(call.error, None);
    }

    #[test]
    fn test_error_resolution() {
        let mut call = ToolCall::running("a", "get_documentation", Map::new());
        call.resolve(None, Some("not found".into()), None);
        assert_eq!(call.status, ToolStatus::Error);
        assert!(call.duration_ms.is_some());
    }

    #[test]
    fn test_placeholder_is_streaming() {
        let msg = Message::assistant_placeholder(Some("c1".into()));
        assert!(msg.is_streaming);
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.content.is_empty());
    }
}
