//! Core abstractions for remote agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentEvent` - Normalized driver event set
//! - `Driver` - Contract every backend adapter implements
//! - `MessageHistory` - Bounded transcript for reconnection replay
//! - `ClientEvent` - Broadcast messages delivered to clients
//! - `StartOptions` - Per-start driver options

pub mod broadcast;
pub mod context;
pub mod event;
pub mod history;
pub mod traits;

pub use broadcast::{AgentSnapshot, ClientEvent, PendingPermission};
pub use context::{StartOptions, project_name_for};
pub use event::{
    AgentEvent, ContentBlock, InitInfo, PermissionRequest, ToolProgress, TurnResult, Usage,
    joined_text,
};
pub use history::{HISTORY_CAPACITY, HistoryEntry, MessageHistory, Role, now_millis};
pub use traits::{
    AgentId, AgentStatus, AgentType, CostPolicy, Driver, DriverError, DriverFactory, EventSink,
    NoWorktree, PermissionBehavior, PermissionMode, WorktreeProbe,
};
