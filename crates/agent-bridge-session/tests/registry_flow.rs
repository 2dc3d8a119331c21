//! Registry flows against the real socket driver attached to in-memory pipes.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines},
    sync::{broadcast, mpsc},
};

use agent_bridge_core::{
    AgentStatus, AgentType, ClientEvent, ContentBlock, CostPolicy, Driver, DriverError,
    DriverFactory, EventSink, NoWorktree, PermissionBehavior, PermissionMode, StartOptions,
};
use agent_bridge_executor::{BackendConfig, ClaudeDriver};
use agent_bridge_session::{Command, CommandReply, RegistryConfig, SessionRegistry, SpawnRequest};

/// Claude driver whose "process" is a duplex pipe handed out to the test.
struct PipedClaude {
    driver: ClaudeDriver,
    pipes: Mutex<Option<(DuplexStream, DuplexStream)>>,
}

#[async_trait]
impl Driver for PipedClaude {
    fn agent_type(&self) -> AgentType {
        AgentType::Claude
    }
    async fn start(&self, agent_id: &str, _opts: StartOptions) -> Result<(), DriverError> {
        let (reader, writer) = self
            .pipes
            .lock()
            .unwrap()
            .take()
            .ok_or(DriverError::AlreadyStarted)?;
        self.driver.start_with_stream(agent_id, reader, writer)
    }
    async fn send_prompt(&self, text: &str, session_id: Option<&str>) {
        self.driver.send_prompt(text, session_id).await;
    }
    async fn respond_permission(
        &self,
        request_id: &str,
        behavior: PermissionBehavior,
        updated_input: Option<Value>,
    ) -> bool {
        self.driver
            .respond_permission(request_id, behavior, updated_input)
            .await
    }
    async fn interrupt(&self) -> Result<(), DriverError> {
        self.driver.interrupt().await
    }
    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), DriverError> {
        self.driver.set_permission_mode(mode).await
    }
    async fn stop(&self) {
        self.driver.stop().await;
    }
    fn cost_policy(&self) -> CostPolicy {
        self.driver.cost_policy()
    }
    fn context_window(&self) -> u64 {
        self.driver.context_window()
    }
}

/// Fake backend end of the pipe.
struct Backend {
    out: DuplexStream,
    input: Lines<BufReader<DuplexStream>>,
}

impl Backend {
    async fn send(&mut self, frame: Value) {
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        self.out.write_all(&line).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.input.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

/// Hands each created driver's backend end to the test.
struct PipeFactory {
    backends: mpsc::UnboundedSender<Backend>,
}

impl DriverFactory for PipeFactory {
    fn create(&self, _agent_type: AgentType, sink: EventSink) -> Result<Arc<dyn Driver>, DriverError> {
        let (driver_read, backend_out) = tokio::io::duplex(64 * 1024);
        let (backend_write, driver_write) = tokio::io::duplex(64 * 1024);
        let _ = self.backends.send(Backend {
            out: backend_out,
            input: BufReader::new(backend_write).lines(),
        });
        Ok(Arc::new(PipedClaude {
            driver: ClaudeDriver::new(
                BackendConfig::claude().with_interrupt_timeout(Duration::from_millis(500)),
                sink,
            ),
            pipes: Mutex::new(Some((driver_read, driver_write))),
        }))
    }
}

struct Bridge {
    registry: SessionRegistry,
    events: broadcast::Receiver<ClientEvent>,
    backend: Backend,
    agent_id: String,
}

impl Bridge {
    async fn start() -> Self {
        let (tx, mut backends) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(
            Arc::new(PipeFactory { backends: tx }),
            Arc::new(NoWorktree),
            RegistryConfig::default(),
        );
        let events = registry.subscribe();
        let reply = registry
            .execute(Command::Spawn(SpawnRequest {
                agent_type: AgentType::Claude,
                cwd: "/work/shop".into(),
                session_name: None,
                model: None,
                resume_session_id: None,
            }))
            .await
            .unwrap();
        let CommandReply::Spawned(agent) = reply else {
            panic!("expected spawn reply");
        };
        let backend = backends.recv().await.unwrap();
        let mut bridge = Self {
            registry,
            events,
            backend,
            agent_id: agent.id,
        };
        bridge
            .backend
            .send(json!({"type": "system", "subtype": "init", "session_id": "s1", "model": "sonnet"}))
            .await;
        bridge
            .until(|e| matches!(e, ClientEvent::AgentUpdated { agent, .. } if agent.status == AgentStatus::Idle))
            .await;
        bridge
    }

    /// Collect broadcasts up to and including the first match.
    async fn until(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    async fn prompt(&mut self, text: &str) {
        tokio_test::assert_ok!(self.registry.send_prompt(&self.agent_id, text).await);
        let frame = self.backend.recv().await;
        assert_eq!(frame["type"], "user");
    }
}

#[tokio::test]
async fn streamed_turn_yields_one_message_and_one_result() {
    let mut bridge = Bridge::start().await;
    bridge.prompt("hi").await;

    for text in ["He", "llo"] {
        bridge
            .backend
            .send(json!({"type": "stream_event", "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}}))
            .await;
    }
    bridge
        .backend
        .send(json!({"type": "result", "subtype": "success", "is_error": false, "duration_ms": 40, "total_cost_usd": 0.01, "usage": {"input_tokens": 20, "output_tokens": 2}, "session_id": "s1"}))
        .await;

    let seen = bridge
        .until(|e| matches!(e, ClientEvent::AgentResult { .. }))
        .await;
    let messages: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            ClientEvent::AssistantMessage { message, .. } => Some(message.content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec![vec![ContentBlock::text("Hello")]]);

    let streamed: String = seen
        .iter()
        .filter_map(|e| match e {
            ClientEvent::StreamChunk { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hello");

    let Some(ClientEvent::AgentResult { total_cost, .. }) = seen.last() else {
        panic!("expected result last");
    };
    assert!((total_cost - 0.01).abs() < f64::EPSILON);

    let agents = bridge.registry.list().await;
    assert_eq!(agents[0].status, AgentStatus::Idle);
    assert_eq!(agents[0].project_name.as_deref(), Some("shop"));
}

#[tokio::test]
async fn auto_approve_answers_backend_without_surfacing_request() {
    let mut bridge = Bridge::start().await;
    bridge
        .registry
        .set_auto_approve(&bridge.agent_id, true)
        .await
        .unwrap();
    bridge.prompt("edit it").await;

    bridge
        .backend
        .send(json!({"type": "control_request", "request_id": "perm-7", "request": {"subtype": "can_use_tool", "tool_name": "Edit", "input": {"path": "a.rs"}}}))
        .await;
    let reply = bridge.backend.recv().await;
    assert_eq!(reply["response"]["request_id"], "perm-7");
    assert_eq!(reply["response"]["response"]["behavior"], "allow");

    bridge
        .backend
        .send(json!({"type": "result", "subtype": "success", "is_error": false, "duration_ms": 5, "usage": {}}))
        .await;
    let seen = bridge
        .until(|e| matches!(e, ClientEvent::AgentResult { .. }))
        .await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ClientEvent::PermissionRequest { .. })));
}

#[tokio::test]
async fn backend_crash_leaves_session_exited_and_destroyable() {
    let mut bridge = Bridge::start().await;
    bridge.prompt("hi").await;
    bridge.backend.out.shutdown().await.unwrap();

    bridge
        .until(|e| matches!(e, ClientEvent::AgentUpdated { agent, .. } if agent.status == AgentStatus::Exited))
        .await;
    assert!(bridge.registry.send_prompt(&bridge.agent_id, "again").await.is_err());

    bridge.registry.destroy(&bridge.agent_id).await.unwrap();
    bridge
        .until(|e| matches!(e, ClientEvent::AgentRemoved { .. }))
        .await;
    assert!(bridge.registry.list().await.is_empty());
}
