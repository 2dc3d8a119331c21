//! Relay server: spawns coding agents on request and streams them to
//! WebSocket clients.
//!
//! Run with: cargo run -p relay-server
//!
//! Then connect a client to ws://127.0.0.1:8787/ws, or follow along with
//! `cargo run -p relay-server --bin relay-watch`.

use std::sync::Arc;

use anyhow::Context;

use agent_bridge_executor::{DefaultDriverFactory, GitCli};
use agent_bridge_session::SessionRegistry;
use agent_bridge_transport::router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_server::init_tracing();
    let config = relay_server::load_config()?;

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(DefaultDriverFactory::new(config.drivers.clone())),
        Arc::new(GitCli::default()),
        config.registry_config(),
    ));
    let app = router(Arc::clone(&registry));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!("Relay listening on ws://{}/ws", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    registry.shutdown().await;
    Ok(())
}
