//! Client-side transcript mirror.
//!
//! Rebuilds per-agent state from the server message stream the way a
//! connected client does: live streaming text, final messages, tool output,
//! pending permissions, and the batched initial history replay.

use std::{collections::HashMap, time::Duration};

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use agent_bridge_core::{
    AgentId, AgentSnapshot, ClientEvent, ContentBlock, HistoryEntry, PendingPermission,
};

use crate::{
    history_batch::{AgentHistory, HistoryBatcher, HistoryOutcome},
    protocol::ServerMessage,
};

/// Mirrored state of one agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentTranscript {
    pub snapshot: Option<AgentSnapshot>,
    pub messages: Vec<HistoryEntry>,
    /// Streamed text of the message currently being produced.
    pub streaming: String,
    /// Tool results of the turn in progress.
    pub tool_results: Vec<ContentBlock>,
    pub permissions: Vec<PendingPermission>,
}

impl AgentTranscript {
    fn set_snapshot(&mut self, snapshot: AgentSnapshot) {
        // The server only reports a count; zero means every request was answered.
        if snapshot.pending_permissions == 0 {
            self.permissions.clear();
        }
        self.snapshot = Some(snapshot);
    }

    fn push_message(&mut self, message: HistoryEntry) {
        if self.messages.iter().any(|m| m.seq == message.seq) {
            return;
        }
        self.messages.push(message);
        self.messages.sort_by_key(|m| m.seq);
    }

    /// Install a replayed history, keeping messages that arrived live with a
    /// newer sequence number.
    fn load(&mut self, history: AgentHistory) {
        let last = history.messages.last().map_or(0, |m| m.seq);
        let live: Vec<_> = self
            .messages
            .drain(..)
            .filter(|m| m.seq > last)
            .collect();
        self.messages = history.messages;
        self.messages.extend(live);
        self.permissions = history.pending_permissions;
    }
}

#[derive(Debug)]
pub struct TranscriptMirror {
    agents: HashMap<AgentId, AgentTranscript>,
    history: HistoryBatcher,
    listed: bool,
    last_error: Option<String>,
}

impl TranscriptMirror {
    #[must_use]
    pub fn new(history_timeout: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            history: HistoryBatcher::new(history_timeout),
            listed: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<&AgentTranscript> {
        self.agents.get(agent_id)
    }

    #[must_use]
    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.history.deadline()
    }

    fn entry(&mut self, agent_id: &str) -> &mut AgentTranscript {
        self.agents.entry(agent_id.to_string()).or_default()
    }

    fn load_all(&mut self, batch: Vec<AgentHistory>) {
        for history in batch {
            let agent_id = history.agent_id.clone();
            self.entry(&agent_id).load(history);
        }
    }

    /// Flush a timed-out history batch.
    pub fn tick(&mut self, now: Instant) {
        if let Some(batch) = self.history.poll_timeout(now) {
            self.load_all(batch);
        }
    }

    /// Apply one server message.
    pub fn apply(&mut self, message: ServerMessage, now: Instant) {
        let event = match message {
            ServerMessage::Event(event) => event,
            ServerMessage::Reply(reply) => {
                if let Some(error) = reply.error {
                    self.last_error = Some(error);
                }
                return;
            }
        };

        match event {
            ClientEvent::AgentList { agents } => {
                if !self.listed {
                    self.listed = true;
                    let stale = self.history.expect(agents.len(), now);
                    self.load_all(stale);
                }
                for agent in agents {
                    let id = agent.id.clone();
                    self.entry(&id).set_snapshot(agent);
                }
            }
            ClientEvent::AgentUpdated { agent_id, agent } => {
                self.entry(&agent_id).set_snapshot(agent);
            }
            ClientEvent::AgentRemoved { agent_id } => {
                self.agents.remove(&agent_id);
                self.history.forget(&agent_id);
            }
            ClientEvent::StreamChunk { agent_id, text } => {
                self.entry(&agent_id).streaming.push_str(&text);
            }
            ClientEvent::AssistantMessage { agent_id, message } => {
                let agent = self.entry(&agent_id);
                agent.streaming.clear();
                agent.push_message(message);
            }
            ClientEvent::AgentResult { agent_id, .. } => {
                let agent = self.entry(&agent_id);
                agent.streaming.clear();
                agent.tool_results.clear();
                agent.permissions.clear();
            }
            ClientEvent::ToolResults { agent_id, content } => {
                let agent = self.entry(&agent_id);
                agent.streaming.clear();
                agent.tool_results.extend(content);
            }
            ClientEvent::PermissionRequest { agent_id, request } => {
                let agent = self.entry(&agent_id);
                agent.permissions.retain(|p| p.request_id != request.request_id);
                agent.permissions.push(PendingPermission {
                    request_id: request.request_id,
                    tool_name: request.tool_name,
                    tool_input: request.tool_input,
                    timestamp: agent_bridge_core::now_millis(),
                });
            }
            ClientEvent::History {
                agent_id,
                messages,
                pending_permissions,
            } => {
                let history = AgentHistory {
                    agent_id,
                    messages,
                    pending_permissions,
                };
                match self.history.offer(history) {
                    HistoryOutcome::Buffered => {}
                    HistoryOutcome::Flush(batch) => self.load_all(batch),
                    HistoryOutcome::PermissionsOnly(history) => {
                        self.entry(&history.agent_id).permissions = history.pending_permissions;
                    }
                }
            }
            ClientEvent::Error { message, .. } => self.last_error = Some(message),
            ClientEvent::ToolProgress { .. } => {}
        }
    }
}

/// Feed `messages` into `mirror` until the stream ends, flushing timed-out
/// history batches along the way. `on_change` sees the mirror after every
/// applied message or flush.
pub async fn follow<S, F>(mirror: &mut TranscriptMirror, messages: S, mut on_change: F)
where
    S: Stream<Item = ServerMessage>,
    F: FnMut(&TranscriptMirror),
{
    let mut messages = std::pin::pin!(messages);
    loop {
        let deadline = mirror.deadline();
        tokio::select! {
            message = messages.next() => {
                let Some(message) = message else { break };
                mirror.apply(message, Instant::now());
            }
            () = sleep_until(deadline) => mirror.tick(Instant::now()),
        }
        on_change(mirror);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use agent_bridge_core::{AgentStatus, AgentType, PermissionMode, Role};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn snapshot(id: &str) -> AgentSnapshot {
        AgentSnapshot {
            id: id.into(),
            agent_type: AgentType::Claude,
            status: AgentStatus::Idle,
            session_id: None,
            session_name: None,
            model: None,
            cwd: None,
            project_name: None,
            git_branch: None,
            total_cost: 0.0,
            output_tokens: 0,
            context_used_percent: 0.0,
            auto_approve: false,
            permission_mode: PermissionMode::Default,
            pending_permissions: 0,
            activity: None,
            last_error: None,
        }
    }

    fn entry(seq: u64, text: &str) -> HistoryEntry {
        HistoryEntry {
            seq,
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
            timestamp: 0,
        }
    }

    fn history(agent_id: &str, messages: Vec<HistoryEntry>) -> ServerMessage {
        ClientEvent::History {
            agent_id: agent_id.into(),
            messages,
            pending_permissions: Vec::new(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn partial_history_batch_flushes_only_after_timeout() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut mirror = TranscriptMirror::new(TIMEOUT);
        let task = tokio::spawn(async move {
            follow(&mut mirror, UnboundedReceiverStream::new(rx), |_| {}).await;
            mirror
        });

        tx.send(
            ClientEvent::AgentList {
                agents: vec![snapshot("a"), snapshot("b"), snapshot("c")],
            }
            .into(),
        )
        .unwrap();
        tx.send(history("a", vec![entry(1, "one")])).unwrap();
        tx.send(history("b", vec![entry(1, "uno")])).unwrap();

        tokio::time::sleep(TIMEOUT - Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
        let mirror = task.await.unwrap();
        assert_eq!(mirror.agent("a").unwrap().messages.len(), 1);
        assert_eq!(mirror.agent("b").unwrap().messages.len(), 1);
        assert!(mirror.agent("c").unwrap().messages.is_empty());
    }

    #[test]
    fn nothing_is_shown_before_the_batch_completes() {
        let now = Instant::now();
        let mut mirror = TranscriptMirror::new(TIMEOUT);
        mirror.apply(
            ClientEvent::AgentList {
                agents: vec![snapshot("a"), snapshot("b"), snapshot("c")],
            }
            .into(),
            now,
        );
        mirror.apply(history("a", vec![entry(1, "one")]), now);
        mirror.apply(history("b", vec![entry(1, "uno")]), now);
        mirror.tick(now + TIMEOUT - Duration::from_millis(1));
        assert!(mirror.agent("a").unwrap().messages.is_empty());

        mirror.tick(now + TIMEOUT);
        assert_eq!(mirror.agent("a").unwrap().messages.len(), 1);
    }

    #[test]
    fn late_history_keeps_live_messages() {
        let now = Instant::now();
        let mut mirror = TranscriptMirror::new(TIMEOUT);
        mirror.apply(ClientEvent::AgentList { agents: vec![snapshot("a")] }.into(), now);
        mirror.apply(history("a", vec![entry(1, "old")]), now);
        mirror.apply(
            ClientEvent::AssistantMessage {
                agent_id: "a".into(),
                message: entry(2, "live"),
            }
            .into(),
            now,
        );

        let late = ClientEvent::History {
            agent_id: "a".into(),
            messages: vec![entry(1, "stale")],
            pending_permissions: vec![PendingPermission {
                request_id: "r1".into(),
                tool_name: "Bash".into(),
                tool_input: serde_json::Value::Null,
                timestamp: 1,
            }],
        };
        mirror.apply(late.into(), now);

        let agent = mirror.agent("a").unwrap();
        let texts: Vec<_> = agent
            .messages
            .iter()
            .map(|m| m.content[0].as_text().unwrap_or_default())
            .collect();
        assert_eq!(texts, vec!["old", "live"]);
        assert_eq!(agent.permissions.len(), 1);
    }

    fn permission(request_id: &str) -> ServerMessage {
        ClientEvent::PermissionRequest {
            agent_id: "a".into(),
            request: agent_bridge_core::PermissionRequest {
                request_id: request_id.into(),
                tool_name: "Bash".into(),
                tool_input: serde_json::Value::Null,
            },
        }
        .into()
    }

    #[test]
    fn answered_permissions_are_dropped() {
        let now = Instant::now();
        let mut mirror = TranscriptMirror::new(TIMEOUT);
        mirror.apply(permission("r1"), now);
        mirror.apply(permission("r2"), now);
        assert_eq!(mirror.agent("a").unwrap().permissions.len(), 2);

        let mut update = snapshot("a");
        update.pending_permissions = 1;
        mirror.apply(
            ClientEvent::AgentUpdated {
                agent_id: "a".into(),
                agent: update.clone(),
            }
            .into(),
            now,
        );
        assert_eq!(mirror.agent("a").unwrap().permissions.len(), 2);

        update.pending_permissions = 0;
        mirror.apply(
            ClientEvent::AgentUpdated {
                agent_id: "a".into(),
                agent: update,
            }
            .into(),
            now,
        );
        assert!(mirror.agent("a").unwrap().permissions.is_empty());

        mirror.apply(permission("r3"), now);
        mirror.apply(
            ClientEvent::AgentResult {
                agent_id: "a".into(),
                result: agent_bridge_core::TurnResult::default(),
                total_cost: 0.0,
                output_tokens: 0,
                context_used_percent: 0.0,
            }
            .into(),
            now,
        );
        assert!(mirror.agent("a").unwrap().permissions.is_empty());
    }

    #[test]
    fn tool_results_are_kept_until_the_turn_ends() {
        let now = Instant::now();
        let mut mirror = TranscriptMirror::new(TIMEOUT);
        mirror.apply(
            ClientEvent::ToolResults {
                agent_id: "a".into(),
                content: vec![ContentBlock::tool_result("tu-1", serde_json::json!("ok"))],
            }
            .into(),
            now,
        );
        assert_eq!(mirror.agent("a").unwrap().tool_results.len(), 1);

        mirror.apply(
            ClientEvent::AgentResult {
                agent_id: "a".into(),
                result: agent_bridge_core::TurnResult::default(),
                total_cost: 0.0,
                output_tokens: 0,
                context_used_percent: 0.0,
            }
            .into(),
            now,
        );
        assert!(mirror.agent("a").unwrap().tool_results.is_empty());
    }

    #[test]
    fn streaming_text_is_replaced_by_the_final_message() {
        let now = Instant::now();
        let mut mirror = TranscriptMirror::new(TIMEOUT);
        for text in ["He", "llo"] {
            mirror.apply(
                ClientEvent::StreamChunk {
                    agent_id: "a".into(),
                    text: text.into(),
                }
                .into(),
                now,
            );
        }
        assert_eq!(mirror.agent("a").unwrap().streaming, "Hello");
        mirror.apply(
            ClientEvent::AssistantMessage {
                agent_id: "a".into(),
                message: entry(3, "Hello"),
            }
            .into(),
            now,
        );
        let agent = mirror.agent("a").unwrap();
        assert!(agent.streaming.is_empty());
        assert_eq!(agent.messages.len(), 1);
    }
}
