//! Core traits for drivers and the worktree collaborator.

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{AgentEvent, StartOptions};

/// Agent session identifier (registry-assigned, not backend-native).
pub type AgentId = String;

/// Channel a driver pushes its normalized events into.
pub type EventSink = mpsc::UnboundedSender<AgentEvent>;

/// Supported agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Claude Code, line-delimited JSON over a loopback socket.
    Claude,
    /// Codex app-server, JSON-RPC over stdio.
    Codex,
    /// Gemini CLI speaking the Agent Client Protocol over stdio.
    Gemini,
}

impl AgentType {
    /// All supported backends.
    pub const ALL: [Self; 3] = [Self::Claude, Self::Codex, Self::Gemini];

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DriverError::UnknownAgentType(s.to_string()))
    }
}

/// Agent session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Backend is launching.
    Starting,
    /// Transport attached, handshake still pending.
    Connected,
    /// Ready for a prompt.
    Idle,
    /// A turn is in flight.
    Running,
    /// A turn is blocked on a permission decision.
    AwaitingPermission,
    /// Driver reported a fault.
    Error,
    /// Backend is gone. Terminal.
    Exited,
}

impl AgentStatus {
    /// Whether a turn is in flight.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Running | Self::AwaitingPermission)
    }
}

/// Permission mode forwarded to drivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Every tool use is surfaced as a permission request.
    #[default]
    Default,
    /// Tool use is allowed without asking.
    Bypass,
}

/// Answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// How a driver's reported turn cost folds into the session total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPolicy {
    /// Reported cost is the running total; overwrite when positive. A lower
    /// figure (a restarted backend's fresh total) never rolls the total back.
    #[default]
    Cumulative,
    /// Reported cost covers one turn; add when positive.
    Additive,
}

impl CostPolicy {
    /// Fold a reported cost into `total`. Never decreases the total.
    #[must_use]
    pub fn apply(self, total: f64, reported: Option<f64>) -> f64 {
        match reported {
            Some(cost) if cost > 0.0 => match self {
                Self::Cumulative => total.max(cost),
                Self::Additive => total + cost,
            },
            _ => total,
        }
    }
}

/// Driver error.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Driver not started")]
    NotStarted,
    #[error("Driver already started")]
    AlreadyStarted,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adapter between one backend protocol and the normalized event set.
///
/// Events flow out through the [`EventSink`] supplied at construction.
/// None of the command methods panic or propagate contract faults: a prompt
/// sent while not ready surfaces as an `error` event, and an unknown
/// permission id is reported as `false`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Which backend this driver speaks to.
    fn agent_type(&self) -> AgentType;

    /// Launch or connect the backend and perform its handshake.
    ///
    /// Eventually emits exactly one `init` on success, or `error`/`exit`
    /// on failure.
    async fn start(&self, agent_id: &str, opts: StartOptions) -> Result<(), DriverError>;

    /// Submit one user turn. Completion is signalled by a `result` event.
    async fn send_prompt(&self, text: &str, session_id: Option<&str>);

    /// Answer one outstanding permission request.
    ///
    /// Returns `false` if `request_id` is unknown or already answered.
    async fn respond_permission(
        &self,
        request_id: &str,
        behavior: PermissionBehavior,
        updated_input: Option<Value>,
    ) -> bool;

    /// Cancel the in-flight turn. A no-op when idle.
    async fn interrupt(&self) -> Result<(), DriverError>;

    /// Change how later permission requests are handled.
    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), DriverError>;

    /// Terminate the backend and reject outstanding calls. Idempotent.
    async fn stop(&self);

    /// How this backend reports cost.
    fn cost_policy(&self) -> CostPolicy {
        CostPolicy::Cumulative
    }

    /// Context window size in tokens.
    fn context_window(&self) -> u64;
}

/// Builds drivers for the registry.
pub trait DriverFactory: Send + Sync {
    /// Create an unstarted driver that reports into `sink`.
    ///
    /// # Errors
    /// Returns error if the backend type is not available.
    fn create(&self, agent_type: AgentType, sink: EventSink) -> Result<Arc<dyn Driver>, DriverError>;
}

/// Read-only view of a working directory's git state.
///
/// Failures are absorbed by implementations; `None` is a valid answer.
#[async_trait]
pub trait WorktreeProbe: Send + Sync {
    /// Current branch name of `cwd`.
    async fn current_branch(&self, cwd: &Path) -> Option<String>;
}

/// Probe that never knows anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWorktree;

#[async_trait]
impl WorktreeProbe for NoWorktree {
    async fn current_branch(&self, _cwd: &Path) -> Option<String> {
        None
    }
}
