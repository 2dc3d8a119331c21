//! Session registry: owns every agent and fans their broadcasts out.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{RwLock, broadcast, mpsc},
    task::JoinHandle,
};

use agent_bridge_core::{
    AgentId, AgentSnapshot, ClientEvent, DriverError, DriverFactory, PermissionBehavior,
    PermissionMode, StartOptions, WorktreeProbe,
};

use crate::{
    batcher::{STREAM_FLUSH_WINDOW, StreamBatcher},
    command::{Command, CommandReply, SpawnRequest},
    session::{AgentSession, SessionSetup},
};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent not found: {0}")]
    NotFound(AgentId),
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("Agent has exited: {0}")]
    Exited(AgentId),
    #[error("Agent is busy: {0}")]
    Busy(AgentId),
}

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub stream_flush: Duration,
    pub broadcast_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stream_flush: STREAM_FLUSH_WINDOW,
            broadcast_capacity: 1024,
        }
    }
}

struct Entry {
    session: Arc<AgentSession>,
    pump: JoinHandle<()>,
}

/// Maps agent ids to sessions and routes commands to them.
pub struct SessionRegistry {
    factory: Arc<dyn DriverFactory>,
    worktree: Arc<dyn WorktreeProbe>,
    agents: RwLock<HashMap<AgentId, Entry>>,
    events: broadcast::Sender<ClientEvent>,
    batcher: Arc<StreamBatcher>,
}

impl SessionRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        worktree: Arc<dyn WorktreeProbe>,
        config: RegistryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let batcher = StreamBatcher::new(config.stream_flush, events.clone());
        Self {
            factory,
            worktree,
            agents: RwLock::new(HashMap::new()),
            events,
            batcher,
        }
    }

    /// Receive every broadcast from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn get(&self, agent_id: &str) -> Result<Arc<AgentSession>, RegistryError> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    /// Snapshots of every agent, sorted by id.
    pub async fn list(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .map(|entry| entry.session.snapshot())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Create a session, wire its driver and start the backend.
    ///
    /// # Errors
    /// Returns error if the driver cannot be created or fails to start.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentSnapshot, RegistryError> {
        let agent_id = uuid::Uuid::new_v4().to_string();
        let (sink, mut rx) = mpsc::unbounded_channel();
        let driver = self.factory.create(request.agent_type, sink)?;

        let session = AgentSession::new(
            SessionSetup {
                id: agent_id.clone(),
                agent_type: request.agent_type,
                cwd: request.cwd.clone(),
                session_name: request.session_name.clone(),
                model: request.model.clone(),
                resume_session_id: request.resume_session_id.clone(),
            },
            Arc::clone(&driver),
            self.events.clone(),
            Arc::clone(&self.batcher),
            Arc::clone(&self.worktree),
        );

        let pump = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    session.handle_event(event).await;
                }
                tracing::debug!(agent_id = %session.id(), "Event stream closed");
            })
        };

        self.agents.write().await.insert(
            agent_id.clone(),
            Entry {
                session: Arc::clone(&session),
                pump,
            },
        );
        tracing::info!(
            agent_id = %agent_id,
            agent_type = %request.agent_type,
            cwd = %request.cwd.display(),
            "Spawning agent"
        );

        let mut opts = StartOptions::new(request.cwd);
        if let Some(id) = request.resume_session_id {
            opts = opts.resume(id);
        }
        if let Some(model) = request.model {
            opts = opts.with_model(model);
        }
        if let Err(e) = driver.start(&agent_id, opts).await {
            tracing::error!(agent_id = %agent_id, "Agent failed to start: {e}");
            let entry = self.agents.write().await.remove(&agent_id);
            if let Some(entry) = entry {
                entry.session.destroy().await;
                entry.pump.abort();
            }
            return Err(e.into());
        }

        let snapshot = session.snapshot();
        let _ = self.events.send(ClientEvent::AgentUpdated {
            agent_id: agent_id.clone(),
            agent: snapshot.clone(),
        });
        session.refresh_branch();
        Ok(snapshot)
    }

    /// Submit a user turn.
    ///
    /// # Errors
    /// Returns error if the agent is unknown, exited, or busy.
    pub async fn send_prompt(&self, agent_id: &str, text: &str) -> Result<(), RegistryError> {
        self.get(agent_id).await?.send_prompt(text).await
    }

    /// Answer a pending permission request. `Ok(false)` if it was unknown.
    ///
    /// # Errors
    /// Returns error if the agent is unknown.
    pub async fn respond_permission(
        &self,
        agent_id: &str,
        request_id: &str,
        behavior: PermissionBehavior,
        updated_input: Option<serde_json::Value>,
    ) -> Result<bool, RegistryError> {
        let session = self.get(agent_id).await?;
        Ok(session
            .respond_permission(request_id, behavior, updated_input)
            .await)
    }

    /// # Errors
    /// Returns error if the agent is unknown or the interrupt failed.
    pub async fn interrupt(&self, agent_id: &str) -> Result<(), RegistryError> {
        self.get(agent_id).await?.interrupt().await
    }

    /// # Errors
    /// Returns error if the agent is unknown or the driver rejects the mode.
    pub async fn set_permission_mode(
        &self,
        agent_id: &str,
        mode: PermissionMode,
    ) -> Result<(), RegistryError> {
        Ok(self.get(agent_id).await?.set_permission_mode(mode).await?)
    }

    /// # Errors
    /// Returns error if the agent is unknown.
    pub async fn set_auto_approve(&self, agent_id: &str, enabled: bool) -> Result<(), RegistryError> {
        self.get(agent_id).await?.set_auto_approve(enabled).await;
        Ok(())
    }

    /// # Errors
    /// Returns error if the agent is unknown.
    pub async fn rename(&self, agent_id: &str, name: Option<String>) -> Result<(), RegistryError> {
        self.get(agent_id).await?.rename(name);
        Ok(())
    }

    /// Transcript replay for one agent.
    ///
    /// # Errors
    /// Returns error if the agent is unknown.
    pub async fn history(&self, agent_id: &str) -> Result<ClientEvent, RegistryError> {
        Ok(self.get(agent_id).await?.history())
    }

    /// Stop an agent and forget it.
    ///
    /// # Errors
    /// Returns error if the agent is unknown.
    pub async fn destroy(&self, agent_id: &str) -> Result<(), RegistryError> {
        let entry = self
            .agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        entry.session.destroy().await;
        entry.pump.abort();
        tracing::info!(agent_id = %agent_id, "Agent destroyed");
        let _ = self.events.send(ClientEvent::AgentRemoved {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Stop every agent.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.agents.write().await.drain().collect();
        for (agent_id, entry) in entries {
            entry.session.destroy().await;
            entry.pump.abort();
            tracing::debug!(agent_id = %agent_id, "Agent stopped on shutdown");
        }
        self.batcher.flush_all();
    }

    /// Route one client command.
    ///
    /// # Errors
    /// Returns error if the target agent is unknown or the operation fails.
    pub async fn execute(&self, command: Command) -> Result<CommandReply, RegistryError> {
        match command {
            Command::Spawn(request) => self.spawn(request).await.map(CommandReply::Spawned),
            Command::SendPrompt { agent_id, text } => {
                self.send_prompt(&agent_id, &text).await?;
                Ok(CommandReply::Done)
            }
            Command::RespondPermission {
                agent_id,
                request_id,
                behavior,
                updated_input,
            } => self
                .respond_permission(&agent_id, &request_id, behavior, updated_input)
                .await
                .map(CommandReply::Answered),
            Command::Interrupt { agent_id } => {
                self.interrupt(&agent_id).await?;
                Ok(CommandReply::Done)
            }
            Command::SetPermissionMode { agent_id, mode } => {
                self.set_permission_mode(&agent_id, mode).await?;
                Ok(CommandReply::Done)
            }
            Command::SetAutoApprove { agent_id, enabled } => {
                self.set_auto_approve(&agent_id, enabled).await?;
                Ok(CommandReply::Done)
            }
            Command::Rename { agent_id, name } => {
                self.rename(&agent_id, name).await?;
                Ok(CommandReply::Done)
            }
            Command::GetHistory { agent_id } => {
                self.history(&agent_id).await.map(CommandReply::History)
            }
            Command::ListAgents => Ok(CommandReply::Agents(self.list().await)),
            Command::Destroy { agent_id } => {
                self.destroy(&agent_id).await?;
                Ok(CommandReply::Done)
            }
        }
    }
}
