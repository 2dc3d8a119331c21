//! Client-facing broadcast messages.
//!
//! Every message carries the id of the agent it concerns and is delivered to
//! every connected client.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    AgentId, AgentStatus, AgentType, ContentBlock, HistoryEntry, PermissionMode,
    PermissionRequest, ToolProgress, TurnResult,
};

/// Permission request waiting on a user decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    /// Unix epoch milliseconds when the request arrived.
    pub timestamp: i64,
}

/// Point-in-time view of an agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub project_name: Option<String>,
    pub git_branch: Option<String>,
    pub total_cost: f64,
    pub output_tokens: u64,
    pub context_used_percent: f64,
    pub auto_approve: bool,
    pub permission_mode: PermissionMode,
    pub pending_permissions: usize,
    /// Latest free-form backend status.
    pub activity: Option<String>,
    pub last_error: Option<String>,
}

/// Message broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Full agent list, sent on connect and on request.
    AgentList { agents: Vec<AgentSnapshot> },
    /// Agent metadata or status changed.
    AgentUpdated {
        agent_id: AgentId,
        agent: AgentSnapshot,
    },
    /// Agent was destroyed.
    AgentRemoved { agent_id: AgentId },
    /// Batched streamed text to append to the live message.
    StreamChunk { agent_id: AgentId, text: String },
    /// A complete assistant message.
    AssistantMessage {
        agent_id: AgentId,
        message: HistoryEntry,
    },
    /// A turn finished.
    AgentResult {
        agent_id: AgentId,
        result: TurnResult,
        total_cost: f64,
        output_tokens: u64,
        context_used_percent: f64,
    },
    /// The agent needs a permission decision.
    PermissionRequest {
        agent_id: AgentId,
        #[serde(flatten)]
        request: PermissionRequest,
    },
    /// Tool heartbeat.
    ToolProgress {
        agent_id: AgentId,
        #[serde(flatten)]
        progress: ToolProgress,
    },
    /// Tool output.
    ToolResults {
        agent_id: AgentId,
        content: Vec<ContentBlock>,
    },
    /// Transcript replay for one agent.
    History {
        agent_id: AgentId,
        messages: Vec<HistoryEntry>,
        pending_permissions: Vec<PendingPermission>,
    },
    /// Command failure reported back to clients.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        message: String,
    },
}

impl ClientEvent {
    /// The agent this message concerns, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::AgentList { .. } => None,
            Self::Error { agent_id, .. } => agent_id.as_deref(),
            Self::AgentUpdated { agent_id, .. }
            | Self::AgentRemoved { agent_id }
            | Self::StreamChunk { agent_id, .. }
            | Self::AssistantMessage { agent_id, .. }
            | Self::AgentResult { agent_id, .. }
            | Self::PermissionRequest { agent_id, .. }
            | Self::ToolProgress { agent_id, .. }
            | Self::ToolResults { agent_id, .. }
            | Self::History { agent_id, .. } => Some(agent_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn permission_request_is_flattened() {
        let event = ClientEvent::PermissionRequest {
            agent_id: "a1".into(),
            request: PermissionRequest {
                request_id: "r1".into(),
                tool_name: "Bash".into(),
                tool_input: json!({"command": "ls"}),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "permissionRequest");
        assert_eq!(value["agentId"], "a1");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["toolInput"]["command"], "ls");
        assert_eq!(event.agent_id(), Some("a1"));
    }
}
