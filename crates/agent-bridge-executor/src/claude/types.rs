//! Claude Code SDK stream messages.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_bridge_core::{ContentBlock, PermissionMode, Usage};

/// Inbound message from the CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliMessage {
    System(SystemMessage),
    StreamEvent {
        event: Value,
    },
    Assistant {
        message: WireMessage,
    },
    User {
        message: WireMessage,
    },
    Result(ResultMessage),
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        elapsed_time_seconds: f64,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestType,
    },
    ControlResponse {
        response: ControlResponseType,
    },
    KeepAlive,
    #[serde(other)]
    Unknown,
}

/// `system` frames: `init` and `status` subtypes.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Message body of `assistant` and `user` frames.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub content: Value,
}

impl WireMessage {
    /// Content blocks. A bare string becomes one text block.
    #[must_use]
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            Value::String(text) => vec![ContentBlock::text(text.clone())],
            Value::Array(_) => {
                serde_json::from_value(self.content.clone()).unwrap_or_else(|e| {
                    tracing::warn!("Unreadable message content: {e}");
                    Vec::new()
                })
            }
            _ => Vec::new(),
        }
    }
}

/// `result` frame closing a turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

/// Requests the CLI sends us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestType {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    HookCallback {
        callback_id: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// Control response in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseType {
    Success {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlResponseType {
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }
}

/// Outbound `control_response` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ControlResponseMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    pub response: ControlResponseType,
}

impl ControlResponseMessage {
    #[must_use]
    pub const fn new(response: ControlResponseType) -> Self {
        Self {
            kind: "control_response",
            response,
        }
    }
}

/// Requests we send to the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SdkControlRequestType {
    Interrupt {},
    SetPermissionMode { mode: &'static str },
}

/// Outbound `control_request` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct SdkControlRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    pub request_id: String,
    pub request: SdkControlRequestType,
}

impl SdkControlRequest {
    #[must_use]
    pub const fn new(request_id: String, request: SdkControlRequestType) -> Self {
        Self {
            kind: "control_request",
            request_id,
            request,
        }
    }
}

/// Outbound user prompt.
#[derive(Debug, Clone, Serialize)]
pub struct UserPrompt {
    #[serde(rename = "type")]
    kind: &'static str,
    pub message: PromptBody,
    pub parent_tool_use_id: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptBody {
    pub role: &'static str,
    pub content: String,
}

impl UserPrompt {
    #[must_use]
    pub fn new(content: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            kind: "user",
            message: PromptBody {
                role: "user",
                content: content.into(),
            },
            parent_tool_use_id: None,
            session_id: session_id.unwrap_or_default(),
        }
    }
}

/// CLI name of a permission mode.
#[must_use]
pub const fn cli_permission_mode(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default => "default",
        PermissionMode::Bypass => "bypassPermissions",
    }
}

/// Text of a `content_block_delta` stream event.
#[must_use]
pub fn text_delta(event: &Value) -> Option<&str> {
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => delta.get("text").and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_can_use_tool() {
        let msg: CliMessage = serde_json::from_value(json!({
            "type": "control_request",
            "request_id": "req-9",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "rm -rf target"},
                "permission_suggestions": []
            }
        }))
        .unwrap();
        assert!(matches!(
            msg,
            CliMessage::ControlRequest { request_id, request: ControlRequestType::CanUseTool { tool_name, .. } }
                if request_id == "req-9" && tool_name == "Bash"
        ));
    }

    #[test]
    fn unknown_frames_do_not_fail() {
        let msg: CliMessage =
            serde_json::from_value(json!({"type": "auth_status", "ok": true})).unwrap();
        assert!(matches!(msg, CliMessage::Unknown));
    }

    #[test]
    fn string_content_becomes_text_block() {
        let message = WireMessage {
            content: json!("plain"),
        };
        assert_eq!(message.blocks(), vec![ContentBlock::text("plain")]);
    }

    #[test]
    fn outbound_frames_are_tagged() {
        let request = serde_json::to_value(SdkControlRequest::new(
            "req_1".into(),
            SdkControlRequestType::SetPermissionMode {
                mode: cli_permission_mode(PermissionMode::Bypass),
            },
        ))
        .unwrap();
        assert_eq!(
            request,
            json!({
                "type": "control_request",
                "request_id": "req_1",
                "request": {"subtype": "set_permission_mode", "mode": "bypassPermissions"}
            })
        );

        let prompt = serde_json::to_value(UserPrompt::new("hi", Some("s1".into()))).unwrap();
        assert_eq!(prompt["type"], "user");
        assert_eq!(prompt["message"]["content"], "hi");
        assert_eq!(prompt["session_id"], "s1");
    }

    #[test]
    fn extracts_text_deltas_only() {
        let delta = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "He"}});
        assert_eq!(text_delta(&delta), Some("He"));
        let thinking = json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "hm"}});
        assert_eq!(text_delta(&thinking), None);
    }
}
