//! Agent session orchestration.
//!
//! Provides:
//! - `AgentSession` - Per-agent state machine fed by driver events
//! - `StreamBatcher` - Shared-timer coalescing of streamed text
//! - `SessionRegistry` - Agent ownership, command routing and broadcast fan-out

pub mod batcher;
pub mod command;
pub mod registry;
pub mod session;

pub use batcher::{STREAM_FLUSH_WINDOW, StreamBatcher};
pub use command::{Command, CommandReply, SpawnRequest};
pub use registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use session::{AgentSession, SessionSetup, context_percent};
