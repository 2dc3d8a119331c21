//! Client-facing transport for the agent bridge.
//!
//! Provides:
//! - Wire protocol (commands in, events and replies out)
//! - WebSocket endpoint (axum)
//! - Bridge configuration
//! - Client-side initial-history batching and transcript mirror

pub mod config;
pub mod history_batch;
pub mod mirror;
pub mod protocol;
pub mod websocket;

pub use config::{BridgeConfig, ConfigError};
pub use history_batch::{AgentHistory, HistoryBatcher, HistoryOutcome};
pub use mirror::{AgentTranscript, TranscriptMirror, follow};
pub use protocol::{ClientRequest, Reply, ServerMessage};
pub use websocket::{ClientSink, SendError, dispatch, router};
