//! Chat Wire Protocol
//!
//! Frames exchanged over `/ws/chat/{conversation_id}`. Every frame is one
//! UTF-8 JSON object discriminated by its `type` field.
//!
//! # Server → client
//!
//! ```text
//! {"type":"text","content":"Hel"}
//! {"type":"tool_use_start","toolId":"tu_1","name":"search_documentation","input":{"query":"setup"}}
//! {"type":"tool_result","toolId":"tu_1","name":"search_documentation","result":[...],"duration":42}
//! {"type":"done","messageId":"..."}
//! {"type":"error","message":"Empty message"}
//! {"type":"pong"}
//! ```
//!
//! # Client → server
//!
//! ```text
//! {"type":"message","content":"How do I deploy?","context":{"scope":"repo","repoName":"backend-api"}}
//! {"type":"cancel"}
//! {"type":"ping"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Server Messages
// ============================================================================

/// Frames received from the chat backend
///
/// Each variant carries only the payload that belongs to its `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A chunk of assistant text
    #[serde(rename_all = "camelCase")]
    Text {
        /// Text delta to append
        content: String,
        /// Message the delta belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// The assistant started a tool invocation
    #[serde(rename_all = "camelCase")]
    ToolUseStart {
        /// Tool invocation id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        /// Tool name (`name` on the wire from the backend)
        #[serde(alias = "name")]
        tool_name: String,
        /// Tool input arguments
        #[serde(default)]
        input: Map<String, Value>,
    },

    /// The tool invocation finished without a separate result frame
    #[serde(rename_all = "camelCase")]
    ToolUseEnd {
        /// Tool invocation id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        /// Tool name
        #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },

    /// Result of a tool invocation
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// Tool invocation id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        /// Tool name
        #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        /// Tool output
        #[serde(default)]
        result: Value,
        /// Server-measured execution time in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        /// Tool failure description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The assistant turn completed
    #[serde(rename_all = "camelCase")]
    Done {
        /// Persisted id of the assistant message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        /// Documents the server cited, if any
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        document_references: Vec<DocumentReference>,
    },

    /// The assistant turn failed
    Error {
        /// Error description (`message` on the wire from the backend)
        #[serde(alias = "message")]
        error: String,
    },

    /// Heartbeat response
    Pong {
        /// Server time, when provided
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
}

impl ServerMessage {
    /// Wire name of this frame's type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUseStart { .. } => "tool_use_start",
            Self::ToolUseEnd { .. } => "tool_use_end",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }

    /// Whether this frame ends an assistant turn
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// A document cited by an assistant answer
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    /// Repository name
    pub repo: String,
    /// File path within the repository
    pub path: String,
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

// ============================================================================
// Client Messages
// ============================================================================

/// Frames sent to the chat backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A user chat message
    Message {
        /// Message text
        content: String,
        /// Retrieval scope for this message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ChatContext>,
    },
    /// Ask the server to stop the current turn
    Cancel,
    /// Liveness check answered by `pong`
    Ping,
}

impl ClientMessage {
    /// Whether the frame may wait in the outbound queue while disconnected
    ///
    /// Only chat messages are queued; cancel and ping only mean something to
    /// a live connection.
    #[must_use]
    pub fn is_queueable(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

/// Retrieval scope of a chat message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    /// Search across every repository
    #[default]
    Global,
    /// Focus on a single repository
    Repo,
}

/// Context attached to a sent message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    /// Retrieval scope
    pub scope: ContextScope,
    /// Repository name when scoped to a repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
}

impl ChatContext {
    /// Organization-wide context
    #[must_use]
    pub fn global() -> Self {
        Self::default()
    }

    /// Context focused on one repository
    #[must_use]
    pub fn repo(name: impl Into<String>) -> Self {
        Self {
            scope: ContextScope::Repo,
            repo_name: Some(name.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_backend_tool_frames() {
        let start: ServerMessage = serde_json::from_value(json!({
            "type": "tool_use_start",
            "toolId": "tu_1",
            "name": "search_documentation",
            "input": {"query": "setup"}
        }))
        .unwrap();

        match start {
            ServerMessage::ToolUseStart {
                tool_id,
                tool_name,
                input,
            } => {
                assert_eq!(tool_id.as_deref(), Some("tu_1"));
                assert_eq!(tool_name, "search_documentation");
                assert_eq!(input.get("query"), Some(&json!("setup")));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let result: ServerMessage = serde_json::from_value(json!({
            "type": "tool_result",
            "toolId": "tu_1",
            "toolName": "search_documentation",
            "result": {"hits": 2},
            "duration": 42
        }))
        .unwrap();

        assert!(matches!(
            result,
            ServerMessage::ToolResult {
                duration: Some(42),
                ..
            }
        ));
    }

    #[test]
    fn test_error_frame_accepts_message_field() {
        let frame: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"Empty message"}"#).unwrap();
        assert_eq!(
            frame,
            ServerMessage::Error {
                error: "Empty message".into()
            }
        );
        assert!(frame.is_terminal());
    }

    #[test]
    fn test_minimal_frames_parse() {
        let pong: ServerMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong.kind(), "pong");

        let done: ServerMessage = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(matches!(done, ServerMessage::Done { message_id: None, .. }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed = serde_json::from_str::<ServerMessage>(r#"{"type":"mystery"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_client_message_wire_format() {
        let msg = ClientMessage::Message {
            content: "hi".into(),
            context: Some(ChatContext::repo("backend-api")),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "message",
                "content": "hi",
                "context": {"scope": "repo", "repoName": "backend-api"}
            })
        );

        assert_eq!(
            serde_json::to_value(ClientMessage::Cancel).unwrap(),
            json!({"type": "cancel"})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn test_only_messages_are_queueable() {
        let msg = ClientMessage::Message {
            content: "x".into(),
            context: None,
        };
        assert!(msg.is_queueable());
        assert!(!ClientMessage::Cancel.is_queueable());
        assert!(!ClientMessage::Ping.is_queueable());
    }

    #[test]
    fn test_global_context_omits_repo() {
        assert_eq!(
            serde_json::to_value(ChatContext::global()).unwrap(),
            json!({"scope": "global"})
        );
    }
}
