//! Follows a running relay and prints agent transcripts as they grow.
//!
//! Run with: cargo run -p relay-server --bin relay-watch [ws://host:port/ws]

use std::collections::HashMap;

use anyhow::Context;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use agent_bridge_core::{Role, joined_text};
use agent_bridge_transport::{ServerMessage, TranscriptMirror, follow};

/// Print messages newer than the last printed sequence number per agent.
fn print_new(mirror: &TranscriptMirror, printed: &mut HashMap<String, u64>) {
    for agent_id in mirror.agent_ids() {
        let Some(agent) = mirror.agent(agent_id) else {
            continue;
        };
        let last = printed.entry(agent_id.to_string()).or_default();
        for message in &agent.messages {
            if message.seq <= *last {
                continue;
            }
            let who = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::System => "system",
            };
            println!("[{agent_id}] {who}: {}", joined_text(&message.content));
            *last = message.seq;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_server::init_tracing();
    let config = relay_server::load_config()?;
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("ws://{}/ws", config.listen));

    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {url}"))?;
    tracing::info!(%url, "Connected");

    let (_outgoing, incoming) = socket.split();
    let messages = incoming.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!("Unreadable server message: {e}");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                tracing::error!("Connection failed: {e}");
                None
            }
        }
    });

    let mut mirror = config.transcript_mirror();
    let mut printed = HashMap::new();
    follow(&mut mirror, messages, |mirror| print_new(mirror, &mut printed)).await;
    if let Some(error) = mirror.last_error() {
        tracing::warn!("Last error from relay: {error}");
    }
    Ok(())
}
