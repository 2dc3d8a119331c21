//! Claude Code driver.
//!
//! The CLI is launched pointed at a loopback listener and connects back to
//! it; after that the two sides exchange line-delimited JSON over the socket.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    process::ChildStdin,
};
use tokio_util::codec::FramedRead;

use agent_bridge_core::{
    AgentEvent, AgentType, ContentBlock, CostPolicy, Driver, DriverError, EventSink, InitInfo,
    PermissionBehavior, PermissionMode, PermissionRequest, StartOptions, ToolProgress, TurnResult,
};

use super::{
    protocol::ProtocolPeer,
    types::{
        CliMessage, ControlRequestType, ResultMessage, SystemMessage, cli_permission_mode,
        text_delta,
    },
};
use crate::{
    codec::{FrameWriter, JsonLineCodec},
    config::BackendConfig,
    lifecycle::DriverCore,
    permissions::{Admission, PermissionGate, PermissionResult},
    process,
    rpc::RpcError,
};

/// Flag that points the CLI at our listener.
const SDK_URL_FLAG: &str = "--sdk-url";

/// Driver for Claude Code.
pub struct ClaudeDriver {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<DriverCore>,
    peer: Mutex<Option<ProtocolPeer>>,
    /// Held open for the life of the process.
    stdin: Mutex<Option<ChildStdin>>,
    /// Original tool input per parked `can_use_tool` request.
    gate: PermissionGate<Value>,
    /// Results still owed by interrupted turns. The CLI's `result` carries no
    /// turn id, so these are matched by count.
    interrupted: AtomicUsize,
}

impl ClaudeDriver {
    #[must_use]
    pub fn new(config: BackendConfig, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: DriverCore::new(AgentType::Claude, config, sink),
                peer: Mutex::new(None),
                stdin: Mutex::new(None),
                gate: PermissionGate::new(),
                interrupted: AtomicUsize::new(0),
            }),
        }
    }

    /// Start on an already connected stream instead of launching the CLI.
    ///
    /// # Errors
    /// Returns error if this driver was already started.
    pub fn start_with_stream<R, W>(
        &self,
        agent_id: &str,
        reader: R,
        writer: W,
    ) -> Result<(), DriverError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.core.begin_start(agent_id)?;
        self.inner.attach(reader, writer);
        Ok(())
    }

    async fn launch(&self, opts: &StartOptions) -> Result<(), DriverError> {
        let inner = &self.inner;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();

        let args = launch_args(port, opts, inner.gate.mode());
        let (stdin, stdout) = inner.core.spawn_backend(opts.cwd(), &args).await?;
        *inner.stdin.lock().unwrap_or_else(PoisonError::into_inner) = Some(stdin);
        process::drain_to_log(stdout, inner.core.agent_id());

        let startup = inner.core.config().startup_timeout();
        let accepted = tokio::select! {
            accepted = tokio::time::timeout(startup, listener.accept()) => accepted,
            () = inner.core.closed() => {
                return Err(DriverError::Handshake("backend exited before connecting".into()));
            }
        };
        let (stream, peer_addr) = accepted.map_err(|_| DriverError::Timeout("backend connection"))??;
        tracing::debug!(agent_id = %inner.core.agent_id(), %peer_addr, "Backend connected");

        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        inner.attach(reader, writer);
        Ok(())
    }
}

fn launch_args(port: u16, opts: &StartOptions, mode: PermissionMode) -> Vec<String> {
    let mut args = vec![
        SDK_URL_FLAG.to_string(),
        format!("tcp://127.0.0.1:{port}"),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--permission-prompt-tool".to_string(),
        "stdio".to_string(),
    ];
    if mode == PermissionMode::Bypass {
        args.extend(["--permission-mode".to_string(), cli_permission_mode(mode).to_string()]);
    }
    if let Some(session_id) = &opts.resume_session_id {
        args.extend(["--resume".to_string(), session_id.clone()]);
    }
    if let Some(model) = &opts.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    args
}

impl Inner {
    fn peer(&self) -> Option<ProtocolPeer> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach<R, W>(self: &Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = ProtocolPeer::new(FrameWriter::new(writer));
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer.clone());

        tokio::spawn(Arc::clone(self).read_loop(reader, peer));
        tokio::spawn(Arc::clone(self).init_watchdog());
    }

    async fn read_loop<R>(self: Arc<Self>, reader: R, peer: ProtocolPeer)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut frames = FramedRead::new(reader, JsonLineCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(value) => self.on_frame(value, &peer).await,
                Err(e) => {
                    tracing::error!(agent_id = %self.core.agent_id(), "Backend stream failed: {e}");
                    break;
                }
            }
        }

        let rejected = peer.close().await;
        self.gate.drain();
        tracing::debug!(agent_id = %self.core.agent_id(), rejected, "Backend stream closed");

        if self.core.has_process() {
            if !self.core.is_stopped() {
                self.core.emit_error("Backend closed the connection");
            }
            self.core.kill_process();
        } else {
            self.core.emit_exit(None, None);
        }
    }

    async fn init_watchdog(self: Arc<Self>) {
        let startup = self.core.config().startup_timeout();
        tokio::select! {
            () = tokio::time::sleep(startup) => {
                if !self.core.is_ready() && !self.core.is_stopped() {
                    tracing::warn!(agent_id = %self.core.agent_id(), ?startup, "No init from backend");
                    self.core.emit_error("Timed out waiting for backend init");
                    self.shutdown().await;
                }
            }
            () = self.core.closed() => {}
        }
    }

    async fn on_frame(&self, value: Value, peer: &ProtocolPeer) {
        let message = match serde_json::from_value::<CliMessage>(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(agent_id = %self.core.agent_id(), "Dropping unreadable frame: {e}");
                return;
            }
        };

        match message {
            CliMessage::System(system) => self.on_system(system),
            CliMessage::StreamEvent { event } => {
                if let Some(text) = text_delta(&event).filter(|t| !t.is_empty()) {
                    self.core.emit(AgentEvent::Stream {
                        text: text.to_string(),
                    });
                }
            }
            CliMessage::Assistant { message } => {
                let content = message.blocks();
                if !content.is_empty() {
                    self.core.emit(AgentEvent::Message { content });
                }
            }
            CliMessage::User { message } => {
                let content: Vec<ContentBlock> = message
                    .blocks()
                    .into_iter()
                    .filter(|block| matches!(block, ContentBlock::ToolResult { .. }))
                    .collect();
                if !content.is_empty() {
                    self.core.emit(AgentEvent::ToolResults { content });
                }
            }
            CliMessage::Result(result) => self.on_result(result),
            CliMessage::ToolProgress {
                tool_use_id,
                tool_name,
                elapsed_time_seconds,
            } => self.core.emit(AgentEvent::ToolProgress(ToolProgress {
                tool_use_id,
                tool_name,
                elapsed_secs: elapsed_time_seconds,
            })),
            CliMessage::ControlRequest {
                request_id,
                request,
            } => self.on_control_request(peer, request_id, request).await,
            CliMessage::ControlResponse { response } => peer.on_control_response(response),
            CliMessage::KeepAlive => {}
            CliMessage::Unknown => {
                tracing::debug!(agent_id = %self.core.agent_id(), "Ignoring unknown frame");
            }
        }
    }

    fn on_system(&self, system: SystemMessage) {
        match system.subtype.as_str() {
            "init" => self.core.mark_ready(InitInfo {
                session_id: system.session_id,
                model: system.model,
                tools: system.tools,
                cwd: system.cwd,
                ..InitInfo::default()
            }),
            "status" => {
                if let Some(status) = system.status {
                    self.core.emit(AgentEvent::Status { status });
                }
            }
            other => tracing::debug!(subtype = other, "Ignoring system frame"),
        }
    }

    fn on_result(&self, result: ResultMessage) {
        self.core.set_session_id(result.session_id.clone());
        let owed = self
            .interrupted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if owed {
            tracing::debug!(
                agent_id = %self.core.agent_id(),
                subtype = ?result.subtype,
                "Dropping result of an interrupted turn"
            );
            return;
        }
        self.core.end_turn();
        if result.is_error {
            tracing::warn!(
                agent_id = %self.core.agent_id(),
                subtype = ?result.subtype,
                detail = ?result.result,
                "Turn ended with error"
            );
        }
        self.core.emit(AgentEvent::Result(TurnResult {
            total_cost: result.total_cost_usd,
            usage: result.usage,
            duration: result.duration_ms,
            is_error: result.is_error,
            session_id: result.session_id,
        }));
    }

    async fn on_control_request(
        &self,
        peer: &ProtocolPeer,
        request_id: String,
        request: ControlRequestType,
    ) {
        let sent = match request {
            ControlRequestType::CanUseTool {
                tool_name, input, ..
            } => match self.gate.admit(request_id.clone(), input.clone()) {
                Admission::Surface => {
                    self.core.emit(AgentEvent::Permission(PermissionRequest {
                        request_id,
                        tool_name,
                        tool_input: input,
                    }));
                    Ok(())
                }
                Admission::AutoAllow(input) => {
                    tracing::debug!(request_id, %tool_name, "Auto-allowing in bypass mode");
                    peer.send_permission_result(
                        request_id,
                        &PermissionResult::Allow {
                            updated_input: input,
                        },
                    )
                    .await
                }
            },
            ControlRequestType::HookCallback { callback_id, .. } => {
                let decision = match self.gate.mode() {
                    PermissionMode::Bypass => "allow",
                    PermissionMode::Default => "ask",
                };
                peer.send_success(
                    request_id,
                    json!({
                        "hookSpecificOutput": {
                            "hookEventName": "PreToolUse",
                            "permissionDecision": decision,
                            "permissionDecisionReason": format!("Hook {callback_id} deferred to permission prompt"),
                        }
                    }),
                )
                .await
            }
            ControlRequestType::Unsupported => {
                peer.send_error(request_id, "Unsupported control request".into())
                    .await
            }
        };
        if let Err(e) = sent {
            tracing::error!(agent_id = %self.core.agent_id(), "Failed to answer control request: {e}");
        }
    }

    async fn shutdown(&self) {
        if !self.core.stop() {
            return;
        }
        drop(self.stdin.lock().unwrap_or_else(PoisonError::into_inner).take());
        self.gate.drain();
        let peer = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(peer) = peer {
            let rejected = peer.close().await;
            tracing::debug!(agent_id = %self.core.agent_id(), rejected, "Driver stopped");
        }
    }
}

#[async_trait]
impl Driver for ClaudeDriver {
    fn agent_type(&self) -> AgentType {
        AgentType::Claude
    }

    async fn start(&self, agent_id: &str, opts: StartOptions) -> Result<(), DriverError> {
        self.inner.core.begin_start(agent_id)?;
        if let Err(e) = self.launch(&opts).await {
            tracing::error!(%agent_id, "Failed to start Claude: {e}");
            self.inner.core.emit_error(&e);
            self.inner.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_prompt(&self, text: &str, session_id: Option<&str>) {
        let core = &self.inner.core;
        let generation = match core.begin_turn() {
            Ok(generation) => generation,
            Err(reason) => {
                core.emit_error(reason);
                return;
            }
        };
        let Some(peer) = self.inner.peer() else {
            core.end_turn_of(generation);
            core.emit_error("Backend is not connected");
            return;
        };

        let session_id = session_id.map(str::to_string).or_else(|| core.session_id());
        if let Err(e) = peer.send_user_message(text, session_id).await {
            core.end_turn_of(generation);
            core.emit_error(format!("Failed to send prompt: {e}"));
        }
    }

    async fn respond_permission(
        &self,
        request_id: &str,
        behavior: PermissionBehavior,
        updated_input: Option<Value>,
    ) -> bool {
        let Some(original_input) = self.inner.gate.take(request_id) else {
            return false;
        };
        let result = match behavior {
            PermissionBehavior::Allow => PermissionResult::Allow {
                updated_input: updated_input.unwrap_or(original_input),
            },
            PermissionBehavior::Deny => PermissionResult::Deny {
                message: "User denied permission".into(),
                interrupt: None,
            },
        };

        match self.inner.peer() {
            Some(peer) => {
                if let Err(e) = peer
                    .send_permission_result(request_id.to_string(), &result)
                    .await
                {
                    tracing::error!(%request_id, "Failed to send permission result: {e}");
                }
            }
            None => tracing::warn!(%request_id, "Permission answered after disconnect"),
        }
        true
    }

    async fn interrupt(&self) -> Result<(), DriverError> {
        let inner = &self.inner;
        let peer = inner.peer();
        let pending = inner.gate.drain();

        if let Some(peer) = &peer {
            for (request_id, _) in pending {
                if let Err(e) = peer
                    .send_permission_result(request_id, &PermissionResult::interrupted())
                    .await
                {
                    tracing::warn!("Failed to cancel permission request: {e}");
                }
            }
        }

        let (Some(generation), Some(peer)) = (inner.core.current_turn(), peer) else {
            return Ok(());
        };

        match peer.interrupt(inner.core.config().interrupt_timeout()).await {
            Ok(_) => {
                // A result that beat the ack already ended the turn.
                if inner.core.end_turn_of(generation) {
                    inner.interrupted.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(RpcError::Transport(e)) => return Err(DriverError::Transport(e)),
            Err(e) => {
                tracing::warn!(agent_id = %inner.core.agent_id(), "Interrupt not acknowledged: {e}");
                inner.core.end_turn_of(generation);
            }
        }
        Ok(())
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), DriverError> {
        self.inner.gate.set_mode(mode);
        if let Some(peer) = self.inner.peer() {
            if let Err(e) = peer
                .set_permission_mode(mode, self.inner.core.config().interrupt_timeout())
                .await
            {
                tracing::warn!(agent_id = %self.inner.core.agent_id(), ?mode, "Mode change not acknowledged: {e}");
            }
        }
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
