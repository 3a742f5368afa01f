//! WebSocket relay protocol.
//!
//! JSON text frames, discriminated by `type`. Inbound frames pass a size
//! cap, a JSON parse, and a field-path-reporting validation before being
//! dispatched; the message enums are matched exhaustively so an unhandled
//! type is a compile error, not a runtime fallback. Every request is
//! answered with either a success frame or a typed `error` frame — a raw
//! exception never reaches the client.

use crate::agents::{A2aPayload, AgentEvent, AgentHandle, AgentSpawner, AgentSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Inbound frames above this byte length are rejected before JSON parsing.
pub const MAX_FRAME_BYTES: usize = 15 * 1024 * 1024;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "start-agent", rename_all = "camelCase")]
    StartAgent {
        task_id: String,
        prompt: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    #[serde(rename = "start-agent-with-context", rename_all = "camelCase")]
    StartAgentWithContext {
        task_id: String,
        #[serde(default)]
        cwd: Option<String>,
        a2a_payload: A2aPayload,
    },
    #[serde(rename = "stop-agent", rename_all = "camelCase")]
    StopAgent { task_id: String },
    #[serde(rename = "list-agents")]
    ListAgents {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "started", rename_all = "camelCase")]
    Started {
        task_id: String,
        pid: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename = "output", rename_all = "camelCase")]
    Output {
        task_id: String,
        data: String,
        stream: OutputStream,
    },
    #[serde(rename = "completed", rename_all = "camelCase")]
    Completed { task_id: String, exit_code: i32 },
    #[serde(rename = "stopped", rename_all = "camelCase")]
    Stopped { task_id: String },
    #[serde(rename = "agents")]
    Agents { list: Vec<AgentSummary> },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        message: String,
    },
}

// ─── Frame parsing & validation ──────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum FrameError {
    /// Byte length over [`MAX_FRAME_BYTES`]; detected before any parsing.
    TooLarge { size: usize },
    Parse(String),
    /// Schema violations, one entry per failing field path.
    Validation(Vec<String>),
}

pub fn parse_client_frame(raw: &str) -> Result<ClientMessage, FrameError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge { size: raw.len() });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| FrameError::Parse(e.to_string()))?;
    let errors = validate_frame(&value);
    if !errors.is_empty() {
        return Err(FrameError::Validation(errors));
    }
    // Validation mirrors the enum shape, so this only fails on a mismatch
    // between the two — report it as a validation failure either way.
    serde_json::from_value(value).map_err(|e| FrameError::Validation(vec![e.to_string()]))
}

/// Collect one error per failing field path, e.g. `"taskId: required string"`.
fn validate_frame(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = value.as_object() else {
        return vec!["frame: expected a JSON object".to_string()];
    };

    match obj.get("type") {
        None => errors.push("type: required string".to_string()),
        Some(Value::String(kind)) => match kind.as_str() {
            "start-agent" => {
                require_string(obj, "taskId", &mut errors);
                require_string(obj, "prompt", &mut errors);
                optional_string(obj, "cwd", &mut errors);
            }
            "start-agent-with-context" => {
                require_string(obj, "taskId", &mut errors);
                optional_string(obj, "cwd", &mut errors);
                validate_a2a_payload(obj.get("a2aPayload"), &mut errors);
            }
            "stop-agent" => {
                require_string(obj, "taskId", &mut errors);
            }
            "list-agents" => {}
            other => errors.push(format!("type: unknown message type {other:?}")),
        },
        Some(_) => errors.push("type: expected string".to_string()),
    }
    errors
}

fn require_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) {
    match obj.get(field) {
        Some(Value::String(_)) => {}
        Some(_) => errors.push(format!("{field}: expected string")),
        None => errors.push(format!("{field}: required string")),
    }
}

fn optional_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) {
    if let Some(v) = obj.get(field) {
        if !v.is_string() && !v.is_null() {
            errors.push(format!("{field}: expected string"));
        }
    }
}

fn validate_a2a_payload(payload: Option<&Value>, errors: &mut Vec<String>) {
    let Some(payload) = payload else {
        errors.push("a2aPayload: required object".to_string());
        return;
    };
    let Some(obj) = payload.as_object() else {
        errors.push("a2aPayload: expected object".to_string());
        return;
    };
    match obj.get("messages") {
        None => errors.push("a2aPayload.messages: required array".to_string()),
        Some(Value::Array(messages)) => {
            for (i, message) in messages.iter().enumerate() {
                let Some(m) = message.as_object() else {
                    errors.push(format!("a2aPayload.messages[{i}]: expected object"));
                    continue;
                };
                if !m.get("role").map(Value::is_string).unwrap_or(false) {
                    errors.push(format!("a2aPayload.messages[{i}].role: required string"));
                }
                if !m.get("content").map(Value::is_string).unwrap_or(false) {
                    errors.push(format!(
                        "a2aPayload.messages[{i}].content: required string"
                    ));
                }
            }
        }
        Some(_) => errors.push("a2aPayload.messages: expected array".to_string()),
    }
}

// ─── Outbound channel ────────────────────────────────────────────────────────

/// Hands serialized frames to the connection's writer task. Sending after
/// the socket closed is a silent no-op — output delivery is best-effort.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<String>,
}

impl OutboundSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: &ServerMessage) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.tx.send(text);
            }
            Err(e) => warn!(err = %e, "failed to serialize outbound frame"),
        }
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

pub struct ProtocolHandler {
    spawner: Arc<AgentSpawner>,
}

impl ProtocolHandler {
    pub fn new(spawner: Arc<AgentSpawner>) -> Self {
        Self { spawner }
    }

    /// Process one inbound text frame. The connection stays open whatever
    /// the outcome; failures become typed `error` frames.
    pub async fn handle_frame(&self, raw: &str, out: &OutboundSender) {
        let message = match parse_client_frame(raw) {
            Ok(m) => m,
            Err(FrameError::TooLarge { size }) => {
                out.send(&ServerMessage::Error {
                    task_id: None,
                    message: format!(
                        "Frame of {size} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
                    ),
                });
                return;
            }
            Err(FrameError::Parse(detail)) => {
                out.send(&ServerMessage::Error {
                    task_id: None,
                    message: format!("Invalid JSON: {detail}"),
                });
                return;
            }
            Err(FrameError::Validation(fields)) => {
                out.send(&ServerMessage::Error {
                    task_id: None,
                    message: format!("Invalid message: {}", fields.join("; ")),
                });
                return;
            }
        };

        match message {
            ClientMessage::StartAgent {
                task_id,
                prompt,
                cwd,
            } => {
                debug!(task_id, "start-agent");
                match self
                    .spawner
                    .spawn_claude_code(&task_id, &prompt, cwd.as_deref())
                    .await
                {
                    Ok(handle) => self.attach(task_id, handle, None, out),
                    Err(e) => out.send(&ServerMessage::Error {
                        task_id: Some(task_id),
                        message: e.to_string(),
                    }),
                }
            }

            ClientMessage::StartAgentWithContext {
                task_id,
                cwd,
                a2a_payload,
            } => {
                debug!(task_id, messages = a2a_payload.messages.len(), "start-agent-with-context");
                match self
                    .spawner
                    .spawn_claude_code_with_context(&task_id, cwd.as_deref(), &a2a_payload)
                    .await
                {
                    Ok((handle, session_id)) => {
                        self.attach(task_id, handle, Some(session_id), out)
                    }
                    Err(e) => out.send(&ServerMessage::Error {
                        task_id: Some(task_id),
                        message: e.to_string(),
                    }),
                }
            }

            ClientMessage::StopAgent { task_id } => {
                if self.spawner.stop_agent(&task_id).await {
                    out.send(&ServerMessage::Stopped { task_id });
                } else {
                    out.send(&ServerMessage::Error {
                        task_id: Some(task_id),
                        message: "No agent found for task".to_string(),
                    });
                }
            }

            ClientMessage::ListAgents {} => {
                let list = self.spawner.list_agents().await;
                out.send(&ServerMessage::Agents { list });
            }
        }
    }

    /// On a successful spawn, emit `started` and stream events until exit.
    /// A missing pid means the spawn silently failed — exactly one `error`
    /// frame, no streaming.
    fn attach(
        &self,
        task_id: String,
        mut handle: AgentHandle,
        session_id: Option<String>,
        out: &OutboundSender,
    ) {
        let Some(pid) = handle.pid else {
            let message = match handle.events.try_recv() {
                Ok(AgentEvent::Error { message }) => message,
                _ => "Failed to spawn agent process".to_string(),
            };
            out.send(&ServerMessage::Error {
                task_id: Some(task_id),
                message,
            });
            return;
        };

        out.send(&ServerMessage::Started {
            task_id: task_id.clone(),
            pid,
            session_id,
        });

        let out = out.clone();
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                match event {
                    AgentEvent::Stdout(data) => out.send(&ServerMessage::Output {
                        task_id: task_id.clone(),
                        data,
                        stream: OutputStream::Stdout,
                    }),
                    AgentEvent::Stderr(data) => out.send(&ServerMessage::Output {
                        task_id: task_id.clone(),
                        data,
                        stream: OutputStream::Stderr,
                    }),
                    AgentEvent::Exited { exit_code } => {
                        out.send(&ServerMessage::Completed {
                            task_id: task_id.clone(),
                            exit_code: exit_code.unwrap_or(-1),
                        });
                        break;
                    }
                    // Spawn errors are handled before streaming attaches.
                    AgentEvent::Error { .. } => {}
                }
            }
        });
    }
}
