//! Client-side batching of the initial history replay.
//!
//! After connecting, a client learns how many agents exist from the first
//! `agentList` and then receives one `history` per agent. Histories are held
//! back until all of them have arrived, or until a safety timeout expires, so
//! every transcript appears at once.

use std::{collections::HashSet, time::Duration};

use tokio::time::Instant;

use agent_bridge_core::{AgentId, HistoryEntry, PendingPermission};

/// One agent's replayed transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentHistory {
    pub agent_id: AgentId,
    pub messages: Vec<HistoryEntry>,
    pub pending_permissions: Vec<PendingPermission>,
}

/// What to do with a history that was just offered.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    /// Held back until the batch completes.
    Buffered,
    /// Apply these transcripts now.
    Flush(Vec<AgentHistory>),
    /// The agent is already loaded; only its permission state may be applied.
    PermissionsOnly(AgentHistory),
}

#[derive(Debug)]
pub struct HistoryBatcher {
    timeout: Duration,
    expected: usize,
    buffered: Vec<AgentHistory>,
    deadline: Option<Instant>,
    loaded: HashSet<AgentId>,
}

impl HistoryBatcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expected: 0,
            buffered: Vec::new(),
            deadline: None,
            loaded: HashSet::new(),
        }
    }

    /// Start a batch of `count` histories. Anything still buffered from an
    /// earlier batch is returned for immediate application.
    pub fn expect(&mut self, count: usize, now: Instant) -> Vec<AgentHistory> {
        let stale = self.take_batch();
        if count > 0 {
            self.expected = count;
            self.deadline = Some(now + self.timeout);
        }
        stale
    }

    /// Offer a received history.
    pub fn offer(&mut self, history: AgentHistory) -> HistoryOutcome {
        if self.loaded.contains(&history.agent_id) {
            return HistoryOutcome::PermissionsOnly(history);
        }
        if self.deadline.is_none() {
            self.loaded.insert(history.agent_id.clone());
            return HistoryOutcome::Flush(vec![history]);
        }

        match self
            .buffered
            .iter_mut()
            .find(|h| h.agent_id == history.agent_id)
        {
            Some(existing) => *existing = history,
            None => self.buffered.push(history),
        }
        if self.buffered.len() >= self.expected {
            HistoryOutcome::Flush(self.take_batch())
        } else {
            HistoryOutcome::Buffered
        }
    }

    /// When the pending batch must be flushed at the latest.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Flush a partial batch once its deadline has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Vec<AgentHistory>> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        let batch = self.take_batch();
        tracing::debug!(
            received = batch.len(),
            expected = self.expected,
            "History batch timed out"
        );
        Some(batch)
    }

    /// Forget that an agent was loaded, e.g. after it was removed.
    pub fn forget(&mut self, agent_id: &str) {
        self.loaded.remove(agent_id);
        self.buffered.retain(|h| h.agent_id != agent_id);
    }

    fn take_batch(&mut self) -> Vec<AgentHistory> {
        self.deadline = None;
        let batch = std::mem::take(&mut self.buffered);
        self.loaded.extend(batch.iter().map(|h| h.agent_id.clone()));
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(agent_id: &str) -> AgentHistory {
        AgentHistory {
            agent_id: agent_id.into(),
            messages: Vec::new(),
            pending_permissions: Vec::new(),
        }
    }

    #[test]
    fn complete_batch_flushes_together() {
        let now = Instant::now();
        let mut batcher = HistoryBatcher::new(Duration::from_secs(3));
        assert!(batcher.expect(2, now).is_empty());
        assert_eq!(batcher.offer(history("a")), HistoryOutcome::Buffered);
        let HistoryOutcome::Flush(batch) = batcher.offer(history("b")) else {
            panic!("expected flush");
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batcher.deadline(), None);
    }

    #[test]
    fn partial_batch_waits_for_the_deadline() {
        let now = Instant::now();
        let timeout = Duration::from_secs(3);
        let mut batcher = HistoryBatcher::new(timeout);
        batcher.expect(3, now);
        batcher.offer(history("a"));
        batcher.offer(history("b"));

        assert_eq!(batcher.poll_timeout(now + timeout - Duration::from_millis(1)), None);
        let batch = batcher.poll_timeout(now + timeout).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batcher.poll_timeout(now + timeout * 2), None);
    }

    #[test]
    fn late_history_only_touches_permissions() {
        let now = Instant::now();
        let mut batcher = HistoryBatcher::new(Duration::from_secs(1));
        batcher.expect(1, now);
        batcher.offer(history("a"));
        assert!(matches!(
            batcher.offer(history("a")),
            HistoryOutcome::PermissionsOnly(h) if h.agent_id == "a"
        ));

        assert!(matches!(batcher.offer(history("c")), HistoryOutcome::Flush(b) if b.len() == 1));

        batcher.forget("a");
        assert!(matches!(batcher.offer(history("a")), HistoryOutcome::Flush(_)));
    }
}
