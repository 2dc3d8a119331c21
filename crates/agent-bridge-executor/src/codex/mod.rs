//! Codex app-server driver (JSON-RPC over stdio).

mod driver;
mod items;

pub use driver::CodexDriver;
