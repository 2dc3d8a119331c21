//! Bounded message history for reconnection replay.

use std::{
    collections::VecDeque,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::ContentBlock;

/// Default number of retained history entries.
pub const HISTORY_CAPACITY: usize = 200;

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// One entry of an agent's transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Position in the transcript, unique per session.
    pub seq: u64,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

/// Ordered transcript keeping only the newest entries.
///
/// New clients replay this before switching to live broadcasts.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    next_seq: u64,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHistory {
    /// Create a history with [`HISTORY_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    /// Create a history retaining at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(32)),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&mut self, role: Role, content: Vec<ContentBlock>) -> &HistoryEntry {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        let entry = HistoryEntry {
            seq: self.next_seq,
            role,
            content,
            timestamp: now_millis(),
        };
        self.next_seq += 1;
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Snapshot of the retained entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Current time as unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_entries() {
        let mut history = MessageHistory::with_capacity(3);
        for i in 0..5 {
            history.push(Role::User, vec![ContentBlock::text(format!("m{i}"))]);
        }

        let texts: Vec<_> = history
            .iter()
            .map(|e| crate::joined_text(&e.content))
            .collect();
        assert_eq!(texts, ["m2", "m3", "m4"]);
        assert_eq!(history.last().map(|e| e.seq), Some(4));
    }

    #[test]
    fn default_capacity_is_two_hundred() {
        let mut history = MessageHistory::new();
        for _ in 0..250 {
            history.push(Role::Assistant, Vec::new());
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.iter().next().map(|e| e.seq), Some(50));
    }
}
