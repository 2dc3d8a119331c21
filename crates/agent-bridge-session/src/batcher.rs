//! Coalescing of streamed text into periodic `streamChunk` broadcasts.
//!
//! All agents share one timer. It is armed by the first delta after a flush
//! and, once the window elapses, flushes every agent's pending text.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::broadcast;

use agent_bridge_core::{AgentId, ClientEvent};

/// Default quiescence window.
pub const STREAM_FLUSH_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Pending {
    /// Per-agent text in first-arrival order.
    text: Vec<(AgentId, String)>,
    armed: bool,
}

/// Shared stream batcher.
#[derive(Debug)]
pub struct StreamBatcher {
    window: Duration,
    pending: Mutex<Pending>,
    out: broadcast::Sender<ClientEvent>,
}

impl StreamBatcher {
    #[must_use]
    pub fn new(window: Duration, out: broadcast::Sender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            window,
            pending: Mutex::new(Pending::default()),
            out,
        })
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, agent_id: AgentId, text: String) {
        // No subscribers is fine; history replay covers late joiners.
        let _ = self.out.send(ClientEvent::StreamChunk { agent_id, text });
    }

    /// Queue a delta, arming the shared timer if it is idle.
    pub fn push(self: &Arc<Self>, agent_id: &str, text: &str) {
        let mut pending = self.pending();
        match pending.text.iter_mut().find(|(id, _)| id == agent_id) {
            Some((_, buffered)) => buffered.push_str(text),
            None => pending.text.push((agent_id.to_string(), text.to_string())),
        }
        if pending.armed {
            return;
        }
        pending.armed = true;
        drop(pending);

        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(batcher.window).await;
            batcher.flush_all();
        });
    }

    /// Flush one agent's pending text now. Returns whether anything was sent.
    pub fn flush_agent(&self, agent_id: &str) -> bool {
        let mut pending = self.pending();
        let Some(pos) = pending.text.iter().position(|(id, _)| id == agent_id) else {
            return false;
        };
        let (agent_id, text) = pending.text.remove(pos);
        self.send(agent_id, text);
        true
    }

    /// Flush everything and disarm the timer.
    pub fn flush_all(&self) {
        let mut pending = self.pending();
        pending.armed = false;
        for (agent_id, text) in std::mem::take(&mut pending.text) {
            self.send(agent_id, text);
        }
    }

    /// Drop an agent's pending text without sending it.
    pub fn discard(&self, agent_id: &str) {
        self.pending().text.retain(|(id, _)| id != agent_id);
    }
}
