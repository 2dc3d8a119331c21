//! Codex app-server driver.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};

use agent_bridge_core::{
    AgentEvent, AgentType, CostPolicy, Driver, DriverError, EventSink, InitInfo,
    PermissionBehavior, PermissionMode, PermissionRequest, StartOptions, TurnResult, Usage,
};

use super::items::{self, ApprovalFlavor};
use crate::{
    codec::FrameWriter,
    config::BackendConfig,
    lifecycle::DriverCore,
    permissions::{Admission, PermissionGate},
    rpc::{self, METHOD_NOT_FOUND, RpcError, RpcPeer, RpcService},
};

const CLIENT_NAME: &str = "agent-bridge";

/// Driver for `codex app-server`.
pub struct CodexDriver {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<DriverCore>,
    rpc: Mutex<Option<RpcPeer>>,
    gate: PermissionGate<PendingApproval>,
    turn: Mutex<TurnTracker>,
}

struct PendingApproval {
    rpc_id: Value,
    flavor: ApprovalFlavor,
}

#[derive(Default)]
struct TurnTracker {
    thread_id: Option<String>,
    turn_id: Option<String>,
    /// Slot generation of the latest prompt.
    generation: u64,
    /// `turn/start` is sent but unanswered, so the new turn id is unknown.
    starting: bool,
    /// Completions received while `starting`.
    held: Vec<Value>,
    /// Interrupted turns whose completion may still arrive.
    retired: HashSet<String>,
    started: Option<Instant>,
    usage: Usage,
}

impl TurnTracker {
    fn retire(&mut self, turn_id: Option<String>) {
        if let Some(turn_id) = turn_id {
            self.retired.insert(turn_id);
        }
    }
}

impl CodexDriver {
    #[must_use]
    pub fn new(config: BackendConfig, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: DriverCore::new(AgentType::Codex, config, sink),
                rpc: Mutex::new(None),
                gate: PermissionGate::new(),
                turn: Mutex::new(TurnTracker::default()),
            }),
        }
    }

    /// Start over an already connected stream instead of launching the
    /// app-server.
    ///
    /// # Errors
    /// Returns error if already started or the handshake fails.
    pub async fn start_with_stream<R, W>(
        &self,
        agent_id: &str,
        opts: StartOptions,
        reader: R,
        writer: W,
    ) -> Result<(), DriverError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.core.begin_start(agent_id)?;
        let peer = self.inner.attach(reader, writer);
        self.inner.finish_start(&peer, &opts).await
    }
}

impl Inner {
    fn turn(&self) -> MutexGuard<'_, TurnTracker> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rpc(&self) -> Option<RpcPeer> {
        self.rpc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach<R, W>(self: &Arc<Self>, reader: R, writer: W) -> RpcPeer
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = RpcPeer::new(FrameWriter::new(writer), self.core.config().rpc_timeout());
        *self.rpc.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer.clone());
        let service = Arc::new(CodexService {
            inner: Arc::clone(self),
        });
        tokio::spawn(rpc::serve(reader, peer.clone(), service));
        peer
    }

    async fn finish_start(&self, peer: &RpcPeer, opts: &StartOptions) -> Result<(), DriverError> {
        match self.handshake(peer, opts).await {
            Ok(info) => {
                self.core.mark_ready(info);
                Ok(())
            }
            Err(e) => {
                tracing::error!(agent_id = %self.core.agent_id(), "Codex handshake failed: {e}");
                self.core.emit_error(&e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, peer: &RpcPeer, opts: &StartOptions) -> Result<InitInfo, DriverError> {
        let timeout = self.core.config().startup_timeout();
        let handshake_err = |e: RpcError| DriverError::Handshake(e.to_string());

        peer.call_with_timeout(
            "initialize",
            json!({"clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")}}),
            timeout,
        )
        .await
        .map_err(handshake_err)?;
        peer.notify("initialized", json!({}))
            .await
            .map_err(handshake_err)?;

        let mut params = json!({"cwd": opts.cwd, "model": opts.model});
        let method = match &opts.resume_session_id {
            Some(thread_id) => {
                params["threadId"] = json!(thread_id);
                "thread/resume"
            }
            None => "thread/start",
        };
        let response = peer
            .call_with_timeout(method, params, timeout)
            .await
            .map_err(handshake_err)?;

        let thread = response.get("thread").unwrap_or(&response);
        let thread_id = thread
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Handshake(format!("{method} response has no thread id")))?
            .to_string();
        self.turn().thread_id = Some(thread_id.clone());

        tracing::info!(agent_id = %self.core.agent_id(), %thread_id, method, "Codex thread ready");
        Ok(InitInfo {
            session_id: Some(thread_id),
            model: response
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| opts.model.clone()),
            cwd: Some(opts.cwd.clone()),
            ..InitInfo::default()
        })
    }

    fn approval_policy(&self) -> &'static str {
        match self.gate.mode() {
            PermissionMode::Default => "on-request",
            PermissionMode::Bypass => "never",
        }
    }

    async fn on_server_request(&self, id: Value, method: &str, params: &Value) {
        let Some(peer) = self.rpc() else {
            return;
        };
        let Some((tool_name, tool_input, flavor)) = items::approval_request(method, params) else {
            tracing::debug!(method, "Unsupported server request");
            if let Err(e) = peer
                .respond_error(id, METHOD_NOT_FOUND, &format!("Method not found: {method}"))
                .await
            {
                tracing::warn!("Failed to answer server request: {e}");
            }
            return;
        };

        let request_id = match &id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let pending = PendingApproval { rpc_id: id, flavor };
        match self.gate.admit(request_id.clone(), pending) {
            Admission::Surface => self.core.emit(AgentEvent::Permission(PermissionRequest {
                request_id,
                tool_name,
                tool_input,
            })),
            Admission::AutoAllow(pending) => {
                let decision = pending.flavor.decision(PermissionBehavior::Allow);
                if let Err(e) = peer.respond(pending.rpc_id, decision).await {
                    tracing::warn!(%request_id, "Failed to auto-approve: {e}");
                }
            }
        }
    }

    fn on_notification(&self, method: &str, params: &Value) {
        match method {
            "item/agentMessage/delta" => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    if !delta.is_empty() {
                        self.core.emit(AgentEvent::Stream {
                            text: delta.to_string(),
                        });
                    }
                }
            }
            "item/started" => {
                if let Some(event) = params.get("item").and_then(items::item_started) {
                    self.core.emit(event);
                }
            }
            "item/completed" => {
                if let Some(event) = params.get("item").and_then(items::item_completed) {
                    self.core.emit(event);
                }
            }
            "thread/tokenUsage/updated" => {
                if let Some(usage) = items::token_usage(params) {
                    self.turn().usage = usage;
                }
            }
            "turn/started" => {
                let turn_id = params
                    .pointer("/turn/id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let mut tracker = self.turn();
                if turn_id.as_ref().is_some_and(|id| !tracker.retired.contains(id)) {
                    tracker.turn_id = turn_id;
                }
            }
            "turn/completed" => self.on_turn_completed(params),
            "thread/compacted" => self.core.emit(AgentEvent::Status {
                status: "compacted".into(),
            }),
            "error" => {
                let message = params
                    .pointer("/error/message")
                    .or_else(|| params.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Codex reported an error");
                if params.get("willRetry").and_then(Value::as_bool) == Some(true) {
                    self.core.emit(AgentEvent::Status {
                        status: format!("retrying: {message}"),
                    });
                } else {
                    self.core.emit_error(message);
                }
            }
            _ => tracing::trace!(method, "Ignoring notification"),
        }
    }

    fn on_turn_completed(&self, params: &Value) {
        let turn = params.get("turn").unwrap_or(params);
        let completed_id = turn.get("id").and_then(Value::as_str);

        let (generation, usage, started, thread_id) = {
            let mut tracker = self.turn();
            if completed_id.is_some_and(|done| tracker.retired.remove(done)) {
                tracing::debug!(?completed_id, "Ignoring completion of an interrupted turn");
                return;
            }
            if tracker.starting {
                tracker.held.push(params.clone());
                return;
            }
            if let (Some(done), Some(current)) = (completed_id, tracker.turn_id.as_deref()) {
                if done != current {
                    tracing::debug!(done, current, "Ignoring completion of a stale turn");
                    return;
                }
            }
            tracker.turn_id = None;
            (
                tracker.generation,
                std::mem::take(&mut tracker.usage),
                tracker.started.take(),
                tracker.thread_id.clone(),
            )
        };
        if !self.core.end_turn_of(generation) {
            tracing::debug!(?completed_id, "Ignoring completion with no turn in flight");
            return;
        }

        let status = turn.get("status").and_then(Value::as_str).unwrap_or("completed");
        #[allow(clippy::cast_possible_truncation)]
        let duration = started.map_or(0, |t| t.elapsed().as_millis() as u64);
        self.core.emit(AgentEvent::Result(TurnResult {
            total_cost: None,
            usage,
            duration,
            is_error: status == "failed",
            session_id: thread_id,
        }));
    }

    /// Record the id `turn/start` returned, then settle completions that
    /// arrived before it.
    fn on_turn_started(&self, generation: u64, turn_id: Option<String>) {
        let held = {
            let mut tracker = self.turn();
            if tracker.generation != generation {
                // A newer prompt owns the tracker.
                tracker.retire(turn_id);
                return;
            }
            tracker.starting = false;
            if self.core.current_turn() == Some(generation) {
                if tracker.turn_id.is_none() {
                    tracker.turn_id = turn_id;
                }
            } else {
                tracker.retire(turn_id);
            }
            std::mem::take(&mut tracker.held)
        };
        for params in held {
            self.on_turn_completed(&params);
        }
    }

    async fn shutdown(&self) {
        if !self.core.stop() {
            return;
        }
        self.gate.drain();
        let peer = self.rpc.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(peer) = peer {
            let rejected = peer.close().await;
            tracing::debug!(agent_id = %self.core.agent_id(), rejected, "Driver stopped");
        }
    }
}

struct CodexService {
    inner: Arc<Inner>,
}

#[async_trait]
impl RpcService for CodexService {
    async fn on_request(&self, id: Value, method: String, params: Value) {
        self.inner.on_server_request(id, &method, &params).await;
    }

    async fn on_notification(&self, method: String, params: Value) {
        self.inner.on_notification(&method, &params);
    }

    async fn on_closed(&self) {
        let inner = &self.inner;
        inner.gate.drain();
        let peer = inner.rpc();
        if let Some(peer) = peer {
            peer.close().await;
        }
        if inner.core.has_process() {
            inner.core.kill_process();
        } else {
            inner.core.emit_exit(None, None);
        }
    }
}

#[async_trait]
impl Driver for CodexDriver {
    fn agent_type(&self) -> AgentType {
        AgentType::Codex
    }

    async fn start(&self, agent_id: &str, opts: StartOptions) -> Result<(), DriverError> {
        let inner = &self.inner;
        inner.core.begin_start(agent_id)?;
        let (stdin, stdout) = match inner.core.spawn_backend(opts.cwd(), &[]).await {
            Ok(pipes) => pipes,
            Err(e) => {
                inner.core.emit_error(&e);
                inner.shutdown().await;
                return Err(e);
            }
        };
        let peer = inner.attach(stdout, stdin);
        inner.finish_start(&peer, &opts).await
    }

    async fn send_prompt(&self, text: &str, session_id: Option<&str>) {
        let inner = &self.inner;
        let generation = match inner.core.begin_turn() {
            Ok(generation) => generation,
            Err(reason) => {
                inner.core.emit_error(reason);
                return;
            }
        };
        let Some(peer) = inner.rpc() else {
            inner.core.end_turn_of(generation);
            inner.core.emit_error("Backend is not connected");
            return;
        };

        let thread_id = {
            let mut tracker = inner.turn();
            tracker.generation = generation;
            tracker.starting = true;
            tracker.held.clear();
            tracker.started = Some(Instant::now());
            tracker.usage = Usage::default();
            tracker.turn_id = None;
            session_id
                .map(str::to_string)
                .or_else(|| tracker.thread_id.clone())
        };
        let params = json!({
            "threadId": thread_id,
            "input": [{"type": "text", "text": text}],
            "approvalPolicy": inner.approval_policy(),
        });

        match peer.call("turn/start", params).await {
            Ok(response) => {
                let turn_id = response
                    .pointer("/turn/id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                inner.on_turn_started(generation, turn_id);
            }
            Err(e) => {
                {
                    let mut tracker = inner.turn();
                    if tracker.generation == generation {
                        tracker.starting = false;
                        tracker.held.clear();
                    }
                }
                if inner.core.end_turn_of(generation) {
                    inner.core.emit_error(format!("turn/start failed: {e}"));
                }
            }
        }
    }

    async fn respond_permission(
        &self,
        request_id: &str,
        behavior: PermissionBehavior,
        _updated_input: Option<Value>,
    ) -> bool {
        let Some(pending) = self.inner.gate.take(request_id) else {
            return false;
        };
        match self.inner.rpc() {
            Some(peer) => {
                if let Err(e) = peer
                    .respond(pending.rpc_id, pending.flavor.decision(behavior))
                    .await
                {
                    tracing::error!(%request_id, "Failed to send approval: {e}");
                }
            }
            None => tracing::warn!(%request_id, "Approval answered after disconnect"),
        }
        true
    }

    async fn interrupt(&self) -> Result<(), DriverError> {
        let inner = &self.inner;
        let peer = inner.rpc();
        let pending = inner.gate.drain();

        if let Some(peer) = &peer {
            for (request_id, approval) in pending {
                if let Err(e) = peer.respond(approval.rpc_id, approval.flavor.cancel()).await {
                    tracing::warn!(%request_id, "Failed to cancel approval: {e}");
                }
            }
        }

        let (Some(generation), Some(peer)) = (inner.core.current_turn(), peer) else {
            return Ok(());
        };
        let (thread_id, turn_id) = {
            let tracker = inner.turn();
            (tracker.thread_id.clone(), tracker.turn_id.clone())
        };

        match peer
            .call_with_timeout(
                "turn/interrupt",
                json!({"threadId": thread_id, "turnId": turn_id}),
                inner.core.config().interrupt_timeout(),
            )
            .await
        {
            Ok(_) => {}
            Err(RpcError::Transport(e)) => return Err(DriverError::Transport(e)),
            Err(e) => tracing::warn!(agent_id = %inner.core.agent_id(), "Interrupt not acknowledged: {e}"),
        }
        if inner.core.end_turn_of(generation) {
            let mut tracker = inner.turn();
            let turn_id = tracker.turn_id.take();
            tracker.retire(turn_id);
        }
        Ok(())
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), DriverError> {
        self.inner.gate.set_mode(mode);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.shutdown().await;
    }

    fn cost_policy(&self) -> CostPolicy {
        self.inner.core.config().cost_policy
    }

    fn context_window(&self) -> u64 {
        self.inner.core.config().context_window
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines},
        sync::mpsc,
    };

    use super::*;

    struct FakeServer {
        out: DuplexStream,
        lines: Lines<BufReader<DuplexStream>>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, frame: Value) {
            let mut line = serde_json::to_vec(&frame).unwrap();
            line.push(b'\n');
            self.out.write_all(&line).await.unwrap();
        }

        async fn answer(&mut self, method: &str, result: Value) -> Value {
            let request = self.recv().await;
            assert_eq!(request["method"], method);
            self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
                .await;
            request
        }
    }

    async fn started(opts: StartOptions) -> (CodexDriver, mpsc::UnboundedReceiver<AgentEvent>, FakeServer, Value) {
        let (tx, mut events) = mpsc::unbounded_channel();
        let driver = CodexDriver::new(BackendConfig::codex(), tx);
        let (driver_read, server_out) = tokio::io::duplex(64 * 1024);
        let (server_in, driver_write) = tokio::io::duplex(64 * 1024);
        let mut server = FakeServer {
            out: server_out,
            lines: BufReader::new(server_in).lines(),
        };

        let start = driver.start_with_stream("a1", opts, driver_read, driver_write);
        let handshake = async {
            server.answer("initialize", json!({"userAgent": "codex"})).await;
            assert_eq!(server.recv().await["method"], "initialized");
            let request = server.recv().await;
            let method = request["method"].as_str().unwrap().to_string();
            server
                .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"thread": {"id": "thr-1"}, "model": "gpt-5-codex"}}))
                .await;
            (method, request)
        };
        let (result, (method, request)) = tokio::join!(start, handshake);
        result.unwrap();
        assert!(method.starts_with("thread/"));

        let AgentEvent::Init(info) = events.recv().await.unwrap() else {
            panic!("expected init");
        };
        assert_eq!(info.session_id.as_deref(), Some("thr-1"));
        assert_eq!(info.model.as_deref(), Some("gpt-5-codex"));
        (driver, events, server, request)
    }

    #[tokio::test]
    async fn resume_uses_thread_resume() {
        let (_driver, _events, _server, request) =
            started(StartOptions::new("/w").resume("thr-1")).await;
        assert_eq!(request["method"], "thread/resume");
        assert_eq!(request["params"]["threadId"], "thr-1");
    }

    #[tokio::test]
    async fn turn_streams_and_completes_without_cost() {
        let (driver, mut events, mut server, _) = started(StartOptions::new("/w")).await;

        let prompt = driver.send_prompt("hi", None);
        let backend = server.answer("turn/start", json!({"turn": {"id": "turn-1"}}));
        let ((), request) = tokio::join!(prompt, backend);
        assert_eq!(request["params"]["threadId"], "thr-1");
        assert_eq!(request["params"]["input"][0]["text"], "hi");
        assert_eq!(request["params"]["approvalPolicy"], "on-request");

        for frame in [
            json!({"jsonrpc": "2.0", "method": "item/agentMessage/delta", "params": {"itemId": "m1", "delta": "He"}}),
            json!({"jsonrpc": "2.0", "method": "item/agentMessage/delta", "params": {"itemId": "m1", "delta": "llo"}}),
            json!({"jsonrpc": "2.0", "method": "item/completed", "params": {"item": {"type": "agentMessage", "id": "m1", "text": "Hello"}}}),
            json!({"jsonrpc": "2.0", "method": "thread/tokenUsage/updated", "params": {"tokenUsage": {"last": {"inputTokens": 1200, "cachedInputTokens": 200, "outputTokens": 40}}}}),
            json!({"jsonrpc": "2.0", "method": "turn/completed", "params": {"turn": {"id": "turn-1", "status": "completed"}}}),
        ] {
            server.send(frame).await;
        }

        assert_eq!(events.recv().await.unwrap(), AgentEvent::Stream { text: "He".into() });
        assert_eq!(events.recv().await.unwrap(), AgentEvent::Stream { text: "llo".into() });
        assert!(matches!(events.recv().await.unwrap(), AgentEvent::Message { .. }));
        let AgentEvent::Result(result) = events.recv().await.unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.total_cost, None);
        assert_eq!(result.usage.output_tokens, 40);
        assert_eq!(result.usage.context_tokens(), 1200);
        assert_eq!(result.session_id.as_deref(), Some("thr-1"));
    }

    #[tokio::test]
    async fn approval_is_answered_with_the_request_id() {
        let (driver, mut events, mut server, _) = started(StartOptions::new("/w")).await;

        server
            .send(json!({"jsonrpc": "2.0", "id": 40, "method": "item/commandExecution/requestApproval", "params": {"itemId": "c1", "command": "ls"}}))
            .await;
        let AgentEvent::Permission(request) = events.recv().await.unwrap() else {
            panic!("expected permission");
        };
        assert_eq!(request.tool_name, "Bash");

        assert!(driver.respond_permission(&request.request_id, PermissionBehavior::Deny, None).await);
        assert!(!driver.respond_permission(&request.request_id, PermissionBehavior::Deny, None).await);

        let reply = server.recv().await;
        assert_eq!(reply["id"], 40);
        assert_eq!(reply["result"]["decision"], "decline");
    }

    #[tokio::test]
    async fn unknown_server_requests_get_method_not_found() {
        let (_driver, _events, mut server, _) = started(StartOptions::new("/w")).await;
        server
            .send(json!({"jsonrpc": "2.0", "id": 7, "method": "item/tool/requestUserInput", "params": {}}))
            .await;
        let reply = server.recv().await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn interrupt_cancels_pending_approvals() {
        let (driver, mut events, mut server, _) = started(StartOptions::new("/w")).await;

        let prompt = driver.send_prompt("go", None);
        let backend = server.answer("turn/start", json!({"turn": {"id": "turn-9"}}));
        tokio::join!(prompt, backend);

        server
            .send(json!({"jsonrpc": "2.0", "id": 41, "method": "execCommandApproval", "params": {"command": ["rm", "x"]}}))
            .await;
        assert!(matches!(events.recv().await.unwrap(), AgentEvent::Permission(_)));

        let interrupt = driver.interrupt();
        let backend = async {
            let cancel = server.recv().await;
            assert_eq!(cancel["id"], 41);
            assert_eq!(cancel["result"]["decision"], "abort");
            let request = server.answer("turn/interrupt", json!({})).await;
            assert_eq!(request["params"]["turnId"], "turn-9");
        };
        let (result, ()) = tokio::join!(interrupt, backend);
        result.unwrap();

        assert!(!driver.respond_permission("41", PermissionBehavior::Allow, None).await);
    }

    async fn interrupted(driver: &CodexDriver, server: &mut FakeServer) {
        let prompt = driver.send_prompt("go", None);
        let backend = server.answer("turn/start", json!({"turn": {"id": "turn-9"}}));
        tokio::join!(prompt, backend);

        let interrupt = driver.interrupt();
        let backend = server.answer("turn/interrupt", json!({}));
        let (result, _) = tokio::join!(interrupt, backend);
        result.unwrap();
        assert!(!driver.inner.core.in_flight());
    }

    #[tokio::test]
    async fn late_completion_of_interrupted_turn_does_not_end_the_next() {
        let (driver, mut events, mut server, _) = started(StartOptions::new("/w")).await;
        interrupted(&driver, &mut server).await;

        let prompt = driver.send_prompt("again", None);
        let backend = async {
            let request = server.recv().await;
            assert_eq!(request["method"], "turn/start");
            server
                .send(json!({"jsonrpc": "2.0", "method": "turn/completed", "params": {"turn": {"id": "turn-9", "status": "interrupted"}}}))
                .await;
            server
                .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"turn": {"id": "turn-10"}}}))
                .await;
        };
        tokio::join!(prompt, backend);

        assert!(events.try_recv().is_err());
        assert!(driver.inner.core.in_flight());

        server
            .send(json!({"jsonrpc": "2.0", "method": "turn/completed", "params": {"turn": {"id": "turn-10", "status": "completed"}}}))
            .await;
        assert!(matches!(events.recv().await.unwrap(), AgentEvent::Result(r) if !r.is_error));
        assert!(!driver.inner.core.in_flight());
    }

    #[tokio::test]
    async fn completion_racing_turn_start_is_settled_by_its_id() {
        let (driver, mut events, mut server, _) = started(StartOptions::new("/w")).await;

        let prompt = driver.send_prompt("quick", None);
        let backend = async {
            let request = server.recv().await;
            server
                .send(json!({"jsonrpc": "2.0", "method": "turn/completed", "params": {"turn": {"id": "turn-4", "status": "completed"}}}))
                .await;
            server
                .send(json!({"jsonrpc": "2.0", "method": "turn/completed", "params": {"turn": {"id": "turn-5", "status": "completed"}}}))
                .await;
            server
                .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"turn": {"id": "turn-5"}}}))
                .await;
        };
        tokio::join!(prompt, backend);

        assert!(matches!(events.try_recv().unwrap(), AgentEvent::Result(_)));
        assert!(events.try_recv().is_err());
        assert!(!driver.inner.core.in_flight());
    }

    #[tokio::test]
    async fn closing_the_stream_exits_once() {
        let (driver, mut events, mut server, _) = started(StartOptions::new("/w")).await;
        server.out.shutdown().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            AgentEvent::Exit {
                code: None,
                signal: None
            }
        );
        driver.stop().await;
        driver.stop().await;
        driver.send_prompt("late", None).await;
        assert_eq!(events.recv().await.unwrap(), AgentEvent::error("Agent has stopped"));
    }
}
