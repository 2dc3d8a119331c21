//! Gemini CLI driver over the Agent Client Protocol.
//!
//! Unlike the other backends, a turn has no completion notification: the
//! `session/prompt` response itself ends it. The agent also calls back into
//! us for permission prompts, file access and terminals.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Notify,
};

use agent_bridge_core::{
    AgentEvent, AgentType, CostPolicy, Driver, DriverError, EventSink, InitInfo,
    PermissionBehavior, PermissionMode, PermissionRequest, StartOptions, TurnResult, Usage,
};

use super::{
    acp::{self, ReplyError, ToolCalls},
    terminal::TerminalManager,
};
use crate::{
    codec::FrameWriter,
    config::BackendConfig,
    lifecycle::DriverCore,
    permissions::{Admission, PermissionGate},
    rpc::{self, METHOD_NOT_FOUND, RpcError, RpcPeer, RpcService},
};

/// Driver for an ACP agent such as `gemini --experimental-acp`.
pub struct GeminiDriver {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<DriverCore>,
    rpc: Mutex<Option<RpcPeer>>,
    gate: PermissionGate<PendingPermission>,
    session: Mutex<AcpSession>,
    turn_done: Notify,
    terminals: TerminalManager,
}

struct PendingPermission {
    rpc_id: Value,
    options: Vec<Value>,
}

#[derive(Default)]
struct AcpSession {
    session_id: Option<String>,
    cwd: PathBuf,
    tools: ToolCalls,
}

impl GeminiDriver {
    #[must_use]
    pub fn new(config: BackendConfig, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: DriverCore::new(AgentType::Gemini, config, sink),
                rpc: Mutex::new(None),
                gate: PermissionGate::new(),
                session: Mutex::new(AcpSession::default()),
                turn_done: Notify::new(),
                terminals: TerminalManager::default(),
            }),
        }
    }

    /// Start over an already connected stream instead of launching the agent.
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

fn launch_args(opts: &StartOptions) -> Vec<String> {
    opts.model
        .as_ref()
        .map(|model| vec!["--model".to_string(), model.clone()])
        .unwrap_or_default()
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, AcpSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
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
        let service = Arc::new(AcpService {
            inner: Arc::clone(self),
        });
        tokio::spawn(rpc::serve(reader, peer.clone(), service));
        peer
    }

    async fn finish_start(&self, peer: &RpcPeer, opts: &StartOptions) -> Result<(), DriverError> {
        self.session().cwd.clone_from(&opts.cwd);
        match self.handshake(peer, opts).await {
            Ok(info) => {
                self.core.mark_ready(info);
                Ok(())
            }
            Err(e) => {
                tracing::error!(agent_id = %self.core.agent_id(), "ACP handshake failed: {e}");
                self.core.emit_error(&e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, peer: &RpcPeer, opts: &StartOptions) -> Result<InitInfo, DriverError> {
        let timeout = self.core.config().startup_timeout();
        let handshake_err = |e: RpcError| DriverError::Handshake(e.to_string());

        let init = peer
            .call_with_timeout("initialize", acp::initialize_params(), timeout)
            .await
            .map_err(handshake_err)?;
        let can_load = init
            .pointer("/agentCapabilities/loadSession")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let session_id = match &opts.resume_session_id {
            Some(session_id) if can_load => {
                peer.call_with_timeout(
                    "session/load",
                    json!({"sessionId": session_id, "cwd": opts.cwd, "mcpServers": []}),
                    timeout,
                )
                .await
                .map_err(handshake_err)?;
                session_id.clone()
            }
            resume => {
                if let Some(session_id) = resume {
                    tracing::warn!(
                        agent_id = %self.core.agent_id(),
                        %session_id,
                        "Agent cannot load sessions; starting a new one"
                    );
                }
                let created = peer
                    .call_with_timeout(
                        "session/new",
                        json!({"cwd": opts.cwd, "mcpServers": []}),
                        timeout,
                    )
                    .await
                    .map_err(handshake_err)?;
                created
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DriverError::Handshake("session/new returned no sessionId".into()))?
                    .to_string()
            }
        };
        self.session().session_id = Some(session_id.clone());

        tracing::info!(agent_id = %self.core.agent_id(), %session_id, "ACP session ready");
        Ok(InitInfo {
            session_id: Some(session_id),
            model: opts.model.clone(),
            cwd: Some(opts.cwd.clone()),
            ..InitInfo::default()
        })
    }

    async fn reply(&self, id: Value, outcome: Result<Value, ReplyError>) {
        let Some(peer) = self.rpc() else {
            return;
        };
        let sent = match outcome {
            Ok(result) => peer.respond(id, result).await,
            Err(e) => peer.respond_error(id, e.code, &e.message).await,
        };
        if let Err(e) = sent {
            tracing::warn!("Failed to answer reverse request: {e}");
        }
    }

    async fn on_permission_request(&self, id: Value, params: &Value) {
        let (tool_name, tool_input) = acp::permission_subject(params);
        let options = params
            .get("options")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let request_id = match &id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        match self
            .gate
            .admit(request_id.clone(), PendingPermission { rpc_id: id, options })
        {
            Admission::Surface => self.core.emit(AgentEvent::Permission(PermissionRequest {
                request_id,
                tool_name,
                tool_input,
            })),
            Admission::AutoAllow(pending) => {
                let outcome = acp::select_option(&pending.options, PermissionBehavior::Allow)
                    .map_or_else(acp::cancelled, |option| acp::selected(&option));
                self.reply(pending.rpc_id, Ok(outcome)).await;
            }
        }
    }

    /// File and terminal requests. Runs off the read loop since
    /// `terminal/wait_for_exit` may block for as long as the command runs.
    async fn on_client_request(&self, method: &str, params: Value) -> Result<Value, ReplyError> {
        let cwd = self.session().cwd.clone();
        match method {
            "fs/read_text_file" => acp::read_text_file(&cwd, acp::params(params)?).await,
            "fs/write_text_file" => acp::write_text_file(&cwd, acp::params(params)?).await,
            "terminal/create" => self.terminals.create(&cwd, acp::params(params)?),
            "terminal/output" => {
                let p: acp::TerminalParams = acp::params(params)?;
                self.terminals.output(&p.terminal_id)
            }
            "terminal/wait_for_exit" => {
                let p: acp::TerminalParams = acp::params(params)?;
                self.terminals.wait_for_exit(&p.terminal_id).await
            }
            "terminal/kill" => {
                let p: acp::TerminalParams = acp::params(params)?;
                self.terminals.kill(&p.terminal_id)
            }
            "terminal/release" => {
                let p: acp::TerminalParams = acp::params(params)?;
                self.terminals.release(&p.terminal_id)
            }
            other => Err(ReplyError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {other}"),
            }),
        }
    }

    fn on_session_update(&self, params: &Value) {
        // `session/load` replays the old transcript before answering.
        if !self.core.is_ready() {
            return;
        }
        let Some(update) = params.get("update") else {
            return;
        };
        let event = self.session().tools.map_update(update);
        if let Some(event) = event {
            self.core.emit(event);
        }
    }

    async fn run_turn(
        &self,
        peer: RpcPeer,
        generation: u64,
        session_id: Option<String>,
        text: String,
    ) {
        let started = Instant::now();
        let outcome = peer
            .call_with_timeout(
                "session/prompt",
                json!({"sessionId": session_id, "prompt": [{"type": "text", "text": text}]}),
                self.core.config().turn_timeout(),
            )
            .await;
        if !self.core.end_turn_of(generation) {
            // Given up on by a timed-out cancel, or the driver stopped.
            tracing::debug!(
                agent_id = %self.core.agent_id(),
                generation,
                ok = outcome.is_ok(),
                "Prompt of an abandoned turn resolved"
            );
            self.turn_done.notify_waiters();
            return;
        }

        match outcome {
            Ok(response) => {
                let stop_reason = response
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .unwrap_or("end_turn");
                tracing::debug!(agent_id = %self.core.agent_id(), stop_reason, "Turn ended");
                #[allow(clippy::cast_possible_truncation)]
                let duration = started.elapsed().as_millis() as u64;
                self.core.emit(AgentEvent::Result(TurnResult {
                    total_cost: None,
                    usage: Usage::default(),
                    duration,
                    is_error: stop_reason == "refusal",
                    session_id,
                }));
            }
            Err(RpcError::Cancelled) => {}
            Err(e) => self.core.emit_error(format!("session/prompt failed: {e}")),
        }
        self.turn_done.notify_waiters();
    }

    async fn shutdown(&self) {
        if !self.core.stop() {
            return;
        }
        self.gate.drain();
        self.terminals.release_all();
        let peer = self.rpc.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(peer) = peer {
            let rejected = peer.close().await;
            tracing::debug!(agent_id = %self.core.agent_id(), rejected, "Driver stopped");
        }
    }
}

struct AcpService {
    inner: Arc<Inner>,
}

#[async_trait]
impl RpcService for AcpService {
    async fn on_request(&self, id: Value, method: String, params: Value) {
        if method == "session/request_permission" {
            self.inner.on_permission_request(id, &params).await;
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.on_client_request(&method, params).await;
            if let Err(e) = &outcome {
                tracing::debug!(%method, code = e.code, "Reverse request failed: {}", e.message);
            }
            inner.reply(id, outcome).await;
        });
    }

    async fn on_notification(&self, method: String, params: Value) {
        match method.as_str() {
            "session/update" => self.inner.on_session_update(&params),
            other => tracing::trace!(method = other, "Ignoring notification"),
        }
    }

    async fn on_closed(&self) {
        let inner = &self.inner;
        inner.gate.drain();
        inner.terminals.release_all();
        if let Some(peer) = inner.rpc() {
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
impl Driver for GeminiDriver {
    fn agent_type(&self) -> AgentType {
        AgentType::Gemini
    }

    async fn start(&self, agent_id: &str, opts: StartOptions) -> Result<(), DriverError> {
        let inner = &self.inner;
        inner.core.begin_start(agent_id)?;
        let (stdin, stdout) = match inner.core.spawn_backend(opts.cwd(), &launch_args(&opts)).await {
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
        let session_id = session_id
            .map(str::to_string)
            .or_else(|| inner.session().session_id.clone());

        let turn = Arc::clone(inner);
        let text = text.to_string();
        tokio::spawn(async move { turn.run_turn(peer, generation, session_id, text).await });
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
        let outcome = acp::select_option(&pending.options, behavior)
            .map_or_else(acp::cancelled, |option| acp::selected(&option));
        self.inner.reply(pending.rpc_id, Ok(outcome)).await;
        true
    }

    async fn interrupt(&self) -> Result<(), DriverError> {
        let inner = &self.inner;
        for (_, pending) in inner.gate.drain() {
            inner.reply(pending.rpc_id, Ok(acp::cancelled())).await;
        }

        let Some(peer) = inner.rpc() else {
            return Ok(());
        };
        let done = inner.turn_done.notified();
        tokio::pin!(done);
        done.as_mut().enable();
        let Some(generation) = inner.core.current_turn() else {
            return Ok(());
        };

        let session_id = inner.session().session_id.clone();
        peer.notify("session/cancel", json!({"sessionId": session_id}))
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        if tokio::time::timeout(inner.core.config().interrupt_timeout(), done)
            .await
            .is_err()
        {
            tracing::warn!(agent_id = %inner.core.agent_id(), "Prompt did not end after cancel");
            inner.core.end_turn_of(generation);
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
