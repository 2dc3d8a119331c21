//! Claude Code driver and SDK stream protocol.

mod driver;
pub mod protocol;
pub mod types;

pub use driver::ClaudeDriver;
pub use protocol::ProtocolPeer;
