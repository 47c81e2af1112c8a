//! Wire protocol for the event and orchestrator streams.
//!
//! These shapes are consumed by browser clients; field names and `type`
//! tags are stable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_session::parser::{MessageClass, PromptAction, SessionActivity};
use agent_session::{BusEvent, WindowInfo};

/// Server → client messages on the event socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        session_id: String,
        window: String,
        text: String,
        class: MessageClass,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actions: Vec<PromptAction>,
        id: String,
        ts: i64,
    },
    TerminalData {
        session_id: String,
        window: String,
        text: String,
    },
    Windows {
        list: Vec<WindowEntry>,
    },
    Status {
        session_id: String,
        window: String,
        status: SessionActivity,
    },
    ProjectEvent {
        project_id: String,
        event: String,
        data: Value,
        ts: i64,
    },
    Error {
        message: String,
    },
}

/// One session in the `windows` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub status: SessionActivity,
}

impl From<WindowInfo> for WindowEntry {
    fn from(info: WindowInfo) -> Self {
        Self {
            id: info.id,
            session_id: info.session_id,
            name: info.name,
            status: info.status,
        }
    }
}

impl ServerMessage {
    /// Expand a bus event into wire messages. Output batches become one
    /// message per segment; `resolve_window` maps a session id to its
    /// window name.
    pub fn from_bus<F>(event: BusEvent, resolve_window: F) -> Vec<ServerMessage>
    where
        F: Fn(&str) -> String,
    {
        match event {
            BusEvent::TerminalData { session_id, text } => {
                let window = resolve_window(&session_id);
                vec![ServerMessage::TerminalData {
                    session_id,
                    window,
                    text,
                }]
            }
            BusEvent::Output {
                session_id,
                messages,
            } => {
                let window = resolve_window(&session_id);
                messages
                    .into_iter()
                    .map(|m| ServerMessage::Output {
                        session_id: m.session_id,
                        window: window.clone(),
                        text: m.text,
                        class: m.class,
                        actions: m.actions,
                        id: m.id,
                        ts: m.timestamp.timestamp(),
                    })
                    .collect()
            }
            BusEvent::Status { session_id, status } => {
                let window = resolve_window(&session_id);
                vec![ServerMessage::Status {
                    session_id,
                    window,
                    status,
                }]
            }
            BusEvent::Windows { list } => vec![ServerMessage::Windows {
                list: list.into_iter().map(WindowEntry::from).collect(),
            }],
            BusEvent::ProjectEvent {
                project_id,
                event,
                data,
                ts,
            } => vec![ServerMessage::ProjectEvent {
                project_id,
                event,
                data,
                ts,
            }],
        }
    }
}

/// Client → server messages on the event socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Omitting `session_id` subscribes to all sessions.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Unsubscribe {
        session_id: String,
    },
    TerminalInput {
        session_id: String,
        text: String,
    },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
}

/// Orchestrator streaming envelope: one chat request, many events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token {
        text: String,
    },
    ToolCall {
        name: String,
        args: Value,
    },
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Done,
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn tool_ok(result: Value) -> Self {
        StreamEvent::ToolResult {
            result: Some(result),
            error: None,
        }
    }

    pub fn tool_err(error: impl Into<String>) -> Self {
        StreamEvent::ToolResult {
            result: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn output_wire_shape_is_stable() {
        let msg = ServerMessage::Output {
            session_id: "s1".to_string(),
            window: "coder".to_string(),
            text: "Proceed? [Y/n]".to_string(),
            class: MessageClass::Prompt,
            actions: vec![PromptAction {
                label: "Yes".to_string(),
                keys: "y\n".to_string(),
            }],
            id: "m1".to_string(),
            ts: 1_700_000_000,
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "type": "output",
                "session_id": "s1",
                "window": "coder",
                "text": "Proceed? [Y/n]",
                "class": "prompt",
                "actions": [{"label": "Yes", "keys": "y\n"}],
                "id": "m1",
                "ts": 1_700_000_000,
            })
        );
    }

    #[test]
    fn windows_snapshot_round_trips_even_empty() {
        let msg = ServerMessage::Windows { list: vec![] };
        let wire = serde_json::to_string(&msg).unwrap();
        assert_eq!(wire, r#"{"type":"windows","list":[]}"#);
    }

    #[test]
    fn subscribe_without_session_means_all() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        match parsed {
            ClientMessage::Subscribe { session_id } => assert!(session_id.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn stream_envelope_shapes() {
        assert_eq!(
            serde_json::to_string(&StreamEvent::Done).unwrap(),
            r#"{"type":"done"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::tool_err("approval_required")).unwrap(),
            r#"{"type":"tool_result","error":"approval_required"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::Token {
                text: "hi".to_string()
            })
            .unwrap(),
            r#"{"type":"token","text":"hi"}"#
        );
    }
}
