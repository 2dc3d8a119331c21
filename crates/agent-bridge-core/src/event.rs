//! Normalized driver events.
//!
//! Every driver translates its backend's native frames into this closed set.
//! Payload shapes are fixed per kind regardless of which backend produced
//! them, so the session layer matches exhaustively on [`AgentEvent`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain assistant or user text.
    Text { text: String },
    /// Model reasoning.
    Thinking { thinking: String },
    /// A tool invocation.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Output of a tool invocation.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Any block kind this crate does not model.
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    /// Text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Tool result block.
    #[must_use]
    pub fn tool_result(tool_use_id: impl Into<String>, content: Value) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    /// The text of a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Concatenate the text blocks of a message.
#[must_use]
pub fn joined_text(content: &[ContentBlock]) -> String {
    content.iter().filter_map(ContentBlock::as_text).collect()
}

/// Token usage reported with a turn result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Tokens occupying the context window.
    #[must_use]
    pub const fn context_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.cache_read_input_tokens)
    }
}

/// Payload of the `init` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

/// Payload of the `result` event that closes a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    /// Cost as reported by the backend; `None` when it does not report cost.
    #[serde(default, alias = "cost", skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub usage: Usage,
    /// Wall-clock duration of the turn in milliseconds.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Payload of the `permission` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
}

/// Payload of the `toolProgress` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProgress {
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub elapsed_secs: f64,
}

/// The closed set of events a driver may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    /// Handshake complete; the driver is ready for prompts.
    Init(InitInfo),
    /// Incremental assistant text.
    Stream { text: String },
    /// A complete assistant message.
    Message { content: Vec<ContentBlock> },
    /// The in-flight turn finished.
    Result(TurnResult),
    /// The backend asks whether a tool may run.
    Permission(PermissionRequest),
    /// A long-running tool is still working.
    ToolProgress(ToolProgress),
    /// Tool output fed back to the model.
    ToolResults { content: Vec<ContentBlock> },
    /// Free-form backend status (e.g. "compacting").
    Status { status: String },
    /// Driver or backend fault.
    Error { message: String },
    /// The backend process or socket is gone.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

impl AgentEvent {
    /// Short kind name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Stream { .. } => "stream",
            Self::Message { .. } => "message",
            Self::Result(_) => "result",
            Self::Permission(_) => "permission",
            Self::ToolProgress(_) => "toolProgress",
            Self::ToolResults { .. } => "toolResults",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Exit { .. } => "exit",
        }
    }

    /// Error event from any displayable message.
    #[must_use]
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}
