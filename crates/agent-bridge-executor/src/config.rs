//! Driver configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use agent_bridge_core::{AgentType, CostPolicy};

use crate::command::CommandBuilder;

const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TURN_TIMEOUT_MS: u64 = 30 * 60 * 1000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_INTERRUPT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// How to launch and talk to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base command, split like a shell command line.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Context window size in tokens.
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default)]
    pub cost_policy: CostPolicy,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Upper bound on a single prompt round trip.
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    /// Upper bound on launch plus handshake.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_interrupt_timeout_ms")]
    pub interrupt_timeout_ms: u64,
}

const fn default_context_window() -> u64 {
    DEFAULT_CONTEXT_WINDOW
}
const fn default_rpc_timeout_ms() -> u64 {
    DEFAULT_RPC_TIMEOUT_MS
}
const fn default_turn_timeout_ms() -> u64 {
    DEFAULT_TURN_TIMEOUT_MS
}
const fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}
const fn default_interrupt_timeout_ms() -> u64 {
    DEFAULT_INTERRUPT_TIMEOUT_MS
}

impl BackendConfig {
    /// Config for `command` with default timeouts.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            cost_policy: CostPolicy::Cumulative,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            turn_timeout_ms: DEFAULT_TURN_TIMEOUT_MS,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            interrupt_timeout_ms: DEFAULT_INTERRUPT_TIMEOUT_MS,
        }
    }

    /// Claude Code in SDK streaming mode.
    #[must_use]
    pub fn claude() -> Self {
        Self::new("claude")
    }

    /// Codex app-server.
    #[must_use]
    pub fn codex() -> Self {
        Self::new("codex app-server").with_context_window(272_000)
    }

    /// Gemini CLI as an ACP agent.
    #[must_use]
    pub fn gemini() -> Self {
        Self::new("gemini --experimental-acp").with_context_window(1_048_576)
    }

    /// Defaults for a backend type.
    #[must_use]
    pub fn for_agent(agent_type: AgentType) -> Self {
        match agent_type {
            AgentType::Claude => Self::claude(),
            AgentType::Codex => Self::codex(),
            AgentType::Gemini => Self::gemini(),
        }
    }

    #[must_use]
    pub const fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = tokens;
        self
    }

    #[must_use]
    pub const fn with_cost_policy(mut self, policy: CostPolicy) -> Self {
        self.cost_policy = policy;
        self
    }

    #[must_use]
    pub fn with_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.interrupt_timeout_ms = duration_ms(timeout);
        self
    }

    /// Command builder with configured args applied.
    #[must_use]
    pub fn command_builder(&self) -> CommandBuilder {
        CommandBuilder::new(self.command.clone()).extend_params(self.args.iter().cloned())
    }

    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub const fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    #[must_use]
    pub const fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Per-backend driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "BackendConfig::claude")]
    pub claude: BackendConfig,
    #[serde(default = "BackendConfig::codex")]
    pub codex: BackendConfig,
    #[serde(default = "BackendConfig::gemini")]
    pub gemini: BackendConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            claude: BackendConfig::claude(),
            codex: BackendConfig::codex(),
            gemini: BackendConfig::gemini(),
        }
    }
}

impl DriverConfig {
    /// Config for one backend.
    #[must_use]
    pub const fn backend(&self, agent_type: AgentType) -> &BackendConfig {
        match agent_type {
            AgentType::Claude => &self.claude,
            AgentType::Codex => &self.codex,
            AgentType::Gemini => &self.gemini,
        }
    }
}
