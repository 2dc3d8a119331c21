//! WebSocket endpoint for remote clients.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use agent_bridge_core::ClientEvent;
use agent_bridge_session::SessionRegistry;

use crate::protocol::{ClientRequest, Reply, ServerMessage, reply_messages};

/// Failure to deliver a message to one client.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Client connection closed")]
    Closed,
}

/// Outgoing half of one client connection.
#[derive(Debug, Clone)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ClientSink {
    /// Queue a message for the client.
    ///
    /// # Errors
    /// Returns error if the message cannot be encoded or the client is gone.
    pub fn send(&self, message: impl Into<ServerMessage>) -> Result<(), SendError> {
        let json = serde_json::to_string(&message.into())?;
        self.tx.send(json).map_err(|_| SendError::Closed)
    }
}

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<SessionRegistry>,
}

/// Router exposing `/ws` and `/health`.
#[must_use]
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(WsState { registry })
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.registry))
}

/// Send the cold-start snapshot: the agent list followed by one history per
/// agent.
///
/// # Errors
/// Returns error if the client went away.
pub async fn send_snapshot(registry: &SessionRegistry, sink: &ClientSink) -> Result<(), SendError> {
    let agents = registry.list().await;
    let ids: Vec<_> = agents.iter().map(|a| a.id.clone()).collect();
    sink.send(ClientEvent::AgentList { agents })?;
    for agent_id in ids {
        // An agent destroyed in between is simply skipped.
        if let Ok(history) = registry.history(&agent_id).await {
            sink.send(history)?;
        }
    }
    Ok(())
}

/// Run one client request and queue its replies.
///
/// # Errors
/// Returns error if the client went away.
pub async fn handle_text(
    registry: &SessionRegistry,
    sink: &ClientSink,
    text: &str,
) -> Result<(), SendError> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Invalid client message: {e}");
            return sink.send(Reply::error(None, format!("Invalid message: {e}")));
        }
    };
    let ClientRequest {
        request_id,
        command,
    } = request;
    tracing::debug!(request_id = ?request_id, agent_id = ?command.agent_id(), "Client command");

    match registry.execute(command).await {
        Ok(reply) => {
            for message in reply_messages(request_id, reply) {
                sink.send(message)?;
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Command failed: {e}");
            sink.send(Reply::error(request_id, e))
        }
    }
}

/// Run one client request on its own task so a slow command (a spawn waiting
/// for its backend, say) does not hold up later ones such as `interrupt`.
/// Replies are matched to requests by `requestId`, not by order.
pub fn dispatch(registry: &Arc<SessionRegistry>, sink: &ClientSink, text: String) {
    let registry = Arc::clone(registry);
    let sink = sink.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_text(&registry, &sink, &text).await {
            tracing::debug!("Reply not delivered: {e}");
        }
    });
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let sink = ClientSink { tx };

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = registry.subscribe();
    if send_snapshot(&registry, &sink).await.is_err() {
        send_task.abort();
        return;
    }

    let forward_task = {
        let sink = sink.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if sink.send(event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Client lagged, replaying snapshot");
                        if send_snapshot(&registry, &sink).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };
        dispatch(&registry, &sink, text);
    }

    forward_task.abort();
    send_task.abort();
    tracing::info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use agent_bridge_core::{
        AgentEvent, AgentType, Driver, DriverError, DriverFactory, EventSink, InitInfo,
        NoWorktree, PermissionBehavior, PermissionMode, StartOptions,
    };
    use agent_bridge_session::RegistryConfig;

    use super::*;

    struct InstantDriver {
        sink: EventSink,
    }

    #[async_trait]
    impl Driver for InstantDriver {
        fn agent_type(&self) -> AgentType {
            AgentType::Gemini
        }
        async fn start(&self, _agent_id: &str, _opts: StartOptions) -> Result<(), DriverError> {
            let _ = self.sink.send(AgentEvent::Init(InitInfo::default()));
            Ok(())
        }
        async fn send_prompt(&self, _text: &str, _session_id: Option<&str>) {}
        async fn respond_permission(
            &self,
            _request_id: &str,
            _behavior: PermissionBehavior,
            _updated_input: Option<Value>,
        ) -> bool {
            false
        }
        async fn interrupt(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn set_permission_mode(&self, _mode: PermissionMode) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop(&self) {}
        fn context_window(&self) -> u64 {
            1_000
        }
    }

    /// Blocks in `start` until released.
    struct GatedDriver {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Driver for GatedDriver {
        fn agent_type(&self) -> AgentType {
            AgentType::Claude
        }
        async fn start(&self, _agent_id: &str, _opts: StartOptions) -> Result<(), DriverError> {
            self.gate.notified().await;
            Ok(())
        }
        async fn send_prompt(&self, _text: &str, _session_id: Option<&str>) {}
        async fn respond_permission(
            &self,
            _request_id: &str,
            _behavior: PermissionBehavior,
            _updated_input: Option<Value>,
        ) -> bool {
            false
        }
        async fn interrupt(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn set_permission_mode(&self, _mode: PermissionMode) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop(&self) {}
        fn context_window(&self) -> u64 {
            1_000
        }
    }

    struct GatedFactory {
        gate: Arc<tokio::sync::Notify>,
    }

    impl DriverFactory for GatedFactory {
        fn create(
            &self,
            _agent_type: AgentType,
            _sink: EventSink,
        ) -> Result<Arc<dyn Driver>, DriverError> {
            Ok(Arc::new(GatedDriver {
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    struct InstantFactory;

    impl DriverFactory for InstantFactory {
        fn create(
            &self,
            _agent_type: AgentType,
            sink: EventSink,
        ) -> Result<Arc<dyn Driver>, DriverError> {
            Ok(Arc::new(InstantDriver { sink }))
        }
    }

    fn client() -> (SessionRegistry, ClientSink, mpsc::UnboundedReceiver<String>) {
        let registry = SessionRegistry::new(
            Arc::new(InstantFactory),
            Arc::new(NoWorktree),
            RegistryConfig::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (registry, ClientSink { tx }, rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|json| serde_json::from_str(&json).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn spawn_then_snapshot_lists_agent_with_history() {
        let (registry, sink, mut rx) = client();
        handle_text(
            &registry,
            &sink,
            r#"{"type":"spawn","requestId":"1","agentType":"gemini","cwd":"/src/app"}"#,
        )
        .await
        .unwrap();
        let replies = received(&mut rx);
        let Some(ServerMessage::Reply(reply)) = replies.last() else {
            panic!("expected reply");
        };
        assert!(reply.ok);
        assert_eq!(reply.request_id.as_deref(), Some("1"));
        let agent_id = reply.result.as_ref().unwrap()["agent"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        send_snapshot(&registry, &sink).await.unwrap();
        let snapshot = received(&mut rx);
        assert!(matches!(
            &snapshot[0],
            ServerMessage::Event(ClientEvent::AgentList { agents }) if agents.len() == 1
        ));
        assert!(matches!(
            &snapshot[1],
            ServerMessage::Event(ClientEvent::History { agent_id: id, .. }) if *id == agent_id
        ));
    }

    #[tokio::test]
    async fn failures_are_replied_not_dropped() {
        let (registry, sink, mut rx) = client();
        handle_text(&registry, &sink, "not json").await.unwrap();
        handle_text(
            &registry,
            &sink,
            r#"{"type":"sendPrompt","requestId":"2","agentId":"ghost","text":"hi"}"#,
        )
        .await
        .unwrap();
        let replies = received(&mut rx);
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], ServerMessage::Reply(Reply { ok: false, request_id: None, .. })));
        let ServerMessage::Reply(reply) = &replies[1] else {
            panic!("expected reply");
        };
        assert_eq!(reply.request_id.as_deref(), Some("2"));
        assert_eq!(reply.error.as_deref(), Some("Agent not found: ghost"));
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<String>) -> Reply {
        loop {
            let json = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerMessage::Reply(reply) = serde_json::from_str(&json).unwrap() {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn slow_spawn_does_not_hold_up_later_commands() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(GatedFactory {
                gate: Arc::clone(&gate),
            }),
            Arc::new(NoWorktree),
            RegistryConfig::default(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ClientSink { tx };

        dispatch(
            &registry,
            &sink,
            r#"{"type":"spawn","requestId":"1","agentType":"claude","cwd":"/src/app"}"#.into(),
        );
        dispatch(&registry, &sink, r#"{"type":"listAgents","requestId":"2"}"#.into());

        let reply = next_reply(&mut rx).await;
        assert_eq!(reply.request_id.as_deref(), Some("2"));
        assert!(reply.ok);

        gate.notify_one();
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply.request_id.as_deref(), Some("1"));
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn closed_client_reports_send_error() {
        let (_registry, sink, rx) = client();
        drop(rx);
        assert!(matches!(
            sink.send(Reply::ok(None, None)),
            Err(SendError::Closed)
        ));
    }
}
