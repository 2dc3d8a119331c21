//! One logical agent: driver events in, client broadcasts out.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use tokio::sync::broadcast;

use agent_bridge_core::{
    AgentEvent, AgentId, AgentSnapshot, AgentStatus, AgentType, ClientEvent, ContentBlock, Driver,
    DriverError, InitInfo, MessageHistory, PendingPermission, PermissionBehavior,
    PermissionMode, PermissionRequest, Role, TurnResult, WorktreeProbe, now_millis,
    project_name_for,
};

use crate::{RegistryError, batcher::StreamBatcher};

/// Mutable state of one agent. Only the session's own handlers touch it.
#[derive(Debug)]
struct SessionState {
    status: AgentStatus,
    session_id: Option<String>,
    session_name: Option<String>,
    model: Option<String>,
    cwd: PathBuf,
    project_name: Option<String>,
    git_branch: Option<String>,
    history: MessageHistory,
    pending: HashMap<String, PendingPermission>,
    total_cost: f64,
    output_tokens: u64,
    context_used_percent: f64,
    auto_approve: bool,
    permission_mode: PermissionMode,
    activity: Option<String>,
    last_error: Option<String>,
    /// Text streamed during the current turn that no final message has
    /// superseded yet.
    turn_text: String,
}

/// Per-spawn settings.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub cwd: PathBuf,
    pub session_name: Option<String>,
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
}

/// An agent session.
pub struct AgentSession {
    id: AgentId,
    agent_type: AgentType,
    driver: Arc<dyn Driver>,
    state: Mutex<SessionState>,
    out: broadcast::Sender<ClientEvent>,
    batcher: Arc<StreamBatcher>,
    worktree: Arc<dyn WorktreeProbe>,
}

impl AgentSession {
    #[must_use]
    pub fn new(
        setup: SessionSetup,
        driver: Arc<dyn Driver>,
        out: broadcast::Sender<ClientEvent>,
        batcher: Arc<StreamBatcher>,
        worktree: Arc<dyn WorktreeProbe>,
    ) -> Arc<Self> {
        let state = SessionState {
            status: AgentStatus::Starting,
            session_id: setup.resume_session_id,
            session_name: setup.session_name,
            model: setup.model,
            project_name: project_name_for(&setup.cwd),
            cwd: setup.cwd,
            git_branch: None,
            history: MessageHistory::new(),
            pending: HashMap::new(),
            total_cost: 0.0,
            output_tokens: 0,
            context_used_percent: 0.0,
            auto_approve: false,
            permission_mode: PermissionMode::Default,
            activity: None,
            last_error: None,
            turn_text: String::new(),
        };
        Arc::new(Self {
            id: setup.id,
            agent_type: setup.agent_type,
            driver,
            state: Mutex::new(state),
            out,
            batcher,
            worktree,
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, event: ClientEvent) {
        let _ = self.out.send(event);
    }

    fn broadcast_update(&self) {
        let agent = self.snapshot();
        self.broadcast(ClientEvent::AgentUpdated {
            agent_id: self.id.clone(),
            agent,
        });
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.state().status
    }

    #[must_use]
    pub fn cwd(&self) -> PathBuf {
        self.state().cwd.clone()
    }

    /// Backend-native session handle, once known.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentSnapshot {
        let state = self.state();
        AgentSnapshot {
            id: self.id.clone(),
            agent_type: self.agent_type,
            status: state.status,
            session_id: state.session_id.clone(),
            session_name: state.session_name.clone(),
            model: state.model.clone(),
            cwd: Some(state.cwd.clone()),
            project_name: state.project_name.clone(),
            git_branch: state.git_branch.clone(),
            total_cost: state.total_cost,
            output_tokens: state.output_tokens,
            context_used_percent: state.context_used_percent,
            auto_approve: state.auto_approve,
            permission_mode: state.permission_mode,
            pending_permissions: state.pending.len(),
            activity: state.activity.clone(),
            last_error: state.last_error.clone(),
        }
    }

    /// Transcript replay for a (re)connecting client.
    #[must_use]
    pub fn history(&self) -> ClientEvent {
        let state = self.state();
        let mut pending: Vec<_> = state.pending.values().cloned().collect();
        pending.sort_by_key(|p| p.timestamp);
        ClientEvent::History {
            agent_id: self.id.clone(),
            messages: state.history.snapshot(),
            pending_permissions: pending,
        }
    }

    fn set_status(state: &mut SessionState, status: AgentStatus) {
        if state.status != AgentStatus::Exited {
            state.status = status;
        }
    }

    /// Append to history and broadcast as an assistant message.
    fn append_message(&self, role: Role, content: Vec<ContentBlock>) {
        let message = self.state().history.push(role, content).clone();
        self.broadcast(ClientEvent::AssistantMessage {
            agent_id: self.id.clone(),
            message,
        });
    }

    /// Emit streamed text that no final message replaced.
    fn commit_turn_text(&self) {
        self.batcher.flush_agent(&self.id);
        let text = std::mem::take(&mut self.state().turn_text);
        if !text.is_empty() {
            self.append_message(Role::Assistant, vec![ContentBlock::text(text)]);
        }
    }

    /// Apply one driver event.
    pub async fn handle_event(self: &Arc<Self>, event: AgentEvent) {
        tracing::trace!(agent_id = %self.id, kind = event.kind(), "Session event");
        match event {
            AgentEvent::Init(info) => self.on_init(info),
            AgentEvent::Stream { text } => {
                self.state().turn_text.push_str(&text);
                self.batcher.push(&self.id, &text);
            }
            AgentEvent::Message { content } => self.on_message(content),
            AgentEvent::Result(result) => self.on_result(result),
            AgentEvent::Permission(request) => self.on_permission(request).await,
            AgentEvent::ToolProgress(progress) => self.broadcast(ClientEvent::ToolProgress {
                agent_id: self.id.clone(),
                progress,
            }),
            AgentEvent::ToolResults { content } => {
                self.commit_turn_text();
                self.state().history.push(Role::Tool, content.clone());
                self.broadcast(ClientEvent::ToolResults {
                    agent_id: self.id.clone(),
                    content,
                });
            }
            AgentEvent::Status { status } => {
                self.state().activity = Some(status);
                self.broadcast_update();
            }
            AgentEvent::Error { message } => {
                tracing::warn!(agent_id = %self.id, "Agent error: {message}");
                self.batcher.flush_agent(&self.id);
                {
                    let mut state = self.state();
                    Self::set_status(&mut state, AgentStatus::Error);
                    state.last_error = Some(message.clone());
                }
                self.broadcast(ClientEvent::Error {
                    agent_id: Some(self.id.clone()),
                    message,
                });
                self.broadcast_update();
            }
            AgentEvent::Exit { code, signal } => {
                tracing::info!(agent_id = %self.id, ?code, ?signal, "Agent exited");
                self.commit_turn_text();
                {
                    let mut state = self.state();
                    state.status = AgentStatus::Exited;
                    state.pending.clear();
                }
                self.broadcast_update();
            }
        }
    }

    fn on_init(&self, info: InitInfo) {
        {
            let mut state = self.state();
            if info.session_id.is_some() {
                state.session_id = info.session_id;
            }
            if info.model.is_some() {
                state.model = info.model;
            }
            if let Some(cwd) = info.cwd {
                state.project_name = project_name_for(&cwd);
                state.cwd = cwd;
            }
            if info.project_name.is_some() {
                state.project_name = info.project_name;
            }
            if info.git_branch.is_some() {
                state.git_branch = info.git_branch;
            }
            // A late init must not demote a session that already moved on.
            if matches!(state.status, AgentStatus::Starting | AgentStatus::Connected) {
                state.status = AgentStatus::Idle;
            }
        }
        self.broadcast_update();
    }

    fn on_message(&self, content: Vec<ContentBlock>) {
        let has_text = content.iter().any(|block| block.as_text().is_some());
        if has_text {
            self.batcher.flush_agent(&self.id);
            self.state().turn_text.clear();
        } else {
            self.commit_turn_text();
        }
        self.append_message(Role::Assistant, content);
    }

    fn on_result(self: &Arc<Self>, result: TurnResult) {
        self.commit_turn_text();

        let (total_cost, output_tokens, context_used_percent) = {
            let mut state = self.state();
            state.total_cost = self
                .driver
                .cost_policy()
                .apply(state.total_cost, result.total_cost);
            state.output_tokens = state.output_tokens.saturating_add(result.usage.output_tokens);
            let context = result.usage.context_tokens();
            if context > 0 {
                state.context_used_percent =
                    context_percent(context, self.driver.context_window());
            }
            if result.session_id.is_some() {
                state.session_id.clone_from(&result.session_id);
            }
            Self::set_status(&mut state, AgentStatus::Idle);
            (
                state.total_cost,
                state.output_tokens,
                state.context_used_percent,
            )
        };

        self.broadcast(ClientEvent::AgentResult {
            agent_id: self.id.clone(),
            result,
            total_cost,
            output_tokens,
            context_used_percent,
        });
        self.broadcast_update();
        self.refresh_branch();
    }

    async fn on_permission(&self, request: PermissionRequest) {
        let auto_approve = self.state().auto_approve;
        if auto_approve {
            tracing::debug!(agent_id = %self.id, request_id = %request.request_id, "Auto-approving");
            self.driver
                .respond_permission(&request.request_id, PermissionBehavior::Allow, None)
                .await;
            return;
        }

        {
            let mut state = self.state();
            state.pending.insert(
                request.request_id.clone(),
                PendingPermission {
                    request_id: request.request_id.clone(),
                    tool_name: request.tool_name.clone(),
                    tool_input: request.tool_input.clone(),
                    timestamp: now_millis(),
                },
            );
            Self::set_status(&mut state, AgentStatus::AwaitingPermission);
        }
        self.broadcast(ClientEvent::PermissionRequest {
            agent_id: self.id.clone(),
            request,
        });
        self.broadcast_update();
    }

    /// Re-read the branch in the background; broadcast only on change.
    pub fn refresh_branch(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let cwd = session.cwd();
            let branch = session.worktree.current_branch(&cwd).await;
            let changed = {
                let mut state = session.state();
                if branch.is_some() && state.git_branch != branch {
                    state.git_branch = branch;
                    true
                } else {
                    false
                }
            };
            if changed {
                session.broadcast_update();
            }
        });
    }

    /// Submit a user turn.
    ///
    /// # Errors
    /// Returns error if the agent has exited or a turn is already running.
    pub async fn send_prompt(&self, text: &str) -> Result<(), RegistryError> {
        let session_id = {
            let mut state = self.state();
            match state.status {
                AgentStatus::Exited => return Err(RegistryError::Exited(self.id.clone())),
                status if status.is_busy() => return Err(RegistryError::Busy(self.id.clone())),
                _ => {}
            }
            state.status = AgentStatus::Running;
            state.turn_text.clear();
            state.last_error = None;
            state.history.push(Role::User, vec![ContentBlock::text(text)]);
            state.session_id.clone()
        };
        self.broadcast_update();
        self.driver.send_prompt(text, session_id.as_deref()).await;
        Ok(())
    }

    /// Answer a pending permission request. `false` if it is unknown.
    pub async fn respond_permission(
        &self,
        request_id: &str,
        behavior: PermissionBehavior,
        updated_input: Option<Value>,
    ) -> bool {
        if self.state().pending.remove(request_id).is_none() {
            return false;
        }
        let answered = self
            .driver
            .respond_permission(request_id, behavior, updated_input)
            .await;
        {
            let mut state = self.state();
            if state.pending.is_empty() && state.status == AgentStatus::AwaitingPermission {
                state.status = AgentStatus::Running;
            }
        }
        self.broadcast_update();
        answered
    }

    /// Cancel the running turn.
    ///
    /// # Errors
    /// Returns error if the driver could not deliver the interrupt.
    pub async fn interrupt(&self) -> Result<(), RegistryError> {
        self.driver.interrupt().await?;
        self.batcher.flush_agent(&self.id);
        {
            let mut state = self.state();
            state.pending.clear();
            if state.status.is_busy() {
                state.status = AgentStatus::Idle;
            }
        }
        self.broadcast_update();
        Ok(())
    }

    /// # Errors
    /// Returns error if the driver rejects the mode change.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), DriverError> {
        self.driver.set_permission_mode(mode).await?;
        self.state().permission_mode = mode;
        self.broadcast_update();
        Ok(())
    }

    /// Toggle auto-approval. Enabling it also approves what is pending.
    pub async fn set_auto_approve(&self, enabled: bool) {
        let pending: Vec<String> = {
            let mut state = self.state();
            state.auto_approve = enabled;
            if enabled {
                state.pending.drain().map(|(id, _)| id).collect()
            } else {
                Vec::new()
            }
        };
        for request_id in pending {
            self.driver
                .respond_permission(&request_id, PermissionBehavior::Allow, None)
                .await;
        }
        {
            let mut state = self.state();
            if state.pending.is_empty() && state.status == AgentStatus::AwaitingPermission {
                state.status = AgentStatus::Running;
            }
        }
        self.broadcast_update();
    }

    pub fn rename(&self, name: Option<String>) {
        self.state().session_name = name.filter(|n| !n.trim().is_empty());
        self.broadcast_update();
    }

    /// Stop the driver and enter the terminal state.
    pub async fn destroy(&self) {
        self.driver.stop().await;
        self.batcher.discard(&self.id);
        let mut state = self.state();
        state.status = AgentStatus::Exited;
        state.pending.clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    #[cfg(test)]
    fn history_entries(&self) -> Vec<agent_bridge_core::HistoryEntry> {
        self.state().history.snapshot()
    }
}

/// Share of the context window in use, clamped to `0..=100`.
#[must_use]
pub fn context_percent(context_tokens: u64, window: u64) -> f64 {
    if window == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let percent = context_tokens as f64 / window as f64 * 100.0;
    percent.clamp(0.0, 100.0)
}
