//! Messages exchanged over the agent WebSocket.
//!
//! Client messages are forwarded to the agent as one JSON line each. Agent
//! output lines are parsed as [`ServerEvent`] and wrapped in a
//! [`ServerMessage`] before reaching the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Prompt {
        content: String,
    },
    Abort,
    Approve {
        tool_use_id: String,
    },
    Reject {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Settings {
        settings: Value,
    },
    ToolResponse {
        tool_use_id: String,
        content: Value,
    },
}

impl ClientMessage {
    /// Whether the message counts as user activity on the project.
    pub fn is_prompt(&self) -> bool {
        matches!(self, Self::Prompt { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    History {
        #[serde(default)]
        messages: Vec<Value>,
    },
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        text: String,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<u32>,
    },
    Error {
        error: String,
    },
}

/// A [`ServerEvent`] as sent to the client.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    pub fn new(event: ServerEvent, agent: impl Into<String>) -> Self {
        Self {
            event,
            agent: agent.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_are_tagged_by_type() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"prompt","content":"fix the tests"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Prompt {
                content: "fix the tests".into()
            }
        );
        assert!(msg.is_prompt());

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"tool_response","tool_use_id":"t1","content":{"ok":true}}"#)
                .unwrap();
        assert!(!msg.is_prompt());

        let abort: ClientMessage = serde_json::from_str(r#"{"type":"abort"}"#).unwrap();
        assert_eq!(abort, ClientMessage::Abort);
    }

    #[test]
    fn unknown_client_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"rm -rf"}"#).is_err());
    }

    #[test]
    fn agent_events_tolerate_extra_fields() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"tool_use","id":"t1","name":"bash","input":{"cmd":"ls"},"extra":1}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::ToolUse {
                id: "t1".into(),
                name: "bash".into(),
                input: json!({"cmd": "ls"}),
            }
        );
    }

    #[test]
    fn server_message_flattens_event() {
        let msg = ServerMessage::new(ServerEvent::Text { text: "hi".into() }, "sandbox-agent");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["agent"], "sandbox-agent");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn done_carries_exit_code() {
        let value = serde_json::to_value(ServerEvent::Done { exit_code: Some(3) }).unwrap();
        assert_eq!(value, json!({"type": "done", "exit_code": 3}));
    }
}
