//! Commands the registry accepts and what it answers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_bridge_core::{
    AgentId, AgentSnapshot, AgentType, ClientEvent, PermissionBehavior, PermissionMode,
};

/// Parameters of a `spawn` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub agent_type: AgentType,
    pub cwd: PathBuf,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub resume_session_id: Option<String>,
}

/// A client command, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Spawn(SpawnRequest),
    SendPrompt {
        agent_id: AgentId,
        text: String,
    },
    RespondPermission {
        agent_id: AgentId,
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default)]
        updated_input: Option<Value>,
    },
    Interrupt {
        agent_id: AgentId,
    },
    SetPermissionMode {
        agent_id: AgentId,
        mode: PermissionMode,
    },
    SetAutoApprove {
        agent_id: AgentId,
        enabled: bool,
    },
    Rename {
        agent_id: AgentId,
        #[serde(default)]
        name: Option<String>,
    },
    GetHistory {
        agent_id: AgentId,
    },
    ListAgents,
    Destroy {
        agent_id: AgentId,
    },
}

impl Command {
    /// Target agent, if the command has one.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Spawn(_) | Self::ListAgents => None,
            Self::SendPrompt { agent_id, .. }
            | Self::RespondPermission { agent_id, .. }
            | Self::Interrupt { agent_id }
            | Self::SetPermissionMode { agent_id, .. }
            | Self::SetAutoApprove { agent_id, .. }
            | Self::Rename { agent_id, .. }
            | Self::GetHistory { agent_id }
            | Self::Destroy { agent_id } => Some(agent_id),
        }
    }
}

/// Result of a successfully executed command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Spawned(AgentSnapshot),
    /// Whether a permission request was still pending.
    Answered(bool),
    History(ClientEvent),
    Agents(Vec<AgentSnapshot>),
    Done,
}
