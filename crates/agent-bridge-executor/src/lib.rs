//! Backend drivers for remote agent sessions.
//!
//! Provides:
//! - Line-delimited JSON framing and a JSON-RPC 2.0 peer
//! - Supervised backend processes and command resolution
//! - Drivers for Claude Code, Codex app-server and ACP agents (Gemini)
//! - A git CLI worktree probe

pub mod claude;
pub mod codec;
pub mod codex;
pub mod command;
pub mod config;
pub mod factory;
pub mod gemini;
pub mod git;
pub mod lifecycle;
pub mod permissions;
pub mod process;
pub mod resolve;
pub mod rpc;

pub use claude::ClaudeDriver;
pub use codec::{CodecError, FrameWriter, JsonLineCodec, MAX_LINE_BYTES};
pub use codex::CodexDriver;
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use config::{BackendConfig, DriverConfig};
pub use factory::DefaultDriverFactory;
pub use gemini::GeminiDriver;
pub use git::{CommitInfo, FileStatus, GitCli, GitError};
pub use rpc::{RpcError, RpcPeer, RpcService};
