//! Rolling Memory
//!
//! Short-lived conversational context per identity plus a global log of
//! recent action summaries. Per-identity queues are time-bounded and pruned
//! before every read or write; the recent-actions log is capacity-bounded.

use crate::types::{Clock, Identity, SharedClock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Default retention horizon for per-identity events
pub const DEFAULT_HORIZON_SECS: i64 = 3600;

/// Default capacity of the recent-actions log
pub const DEFAULT_RECENT_ACTIONS: usize = 500;

/// One remembered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
    /// Message text
    pub content: String,
}

/// Point-in-time copy of the whole store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemorySnapshot {
    /// Unexpired events per identity
    pub conversations: BTreeMap<Identity, Vec<MemoryEvent>>,
    /// Recent action summaries, oldest first
    pub recent_actions: Vec<String>,
}

/// Per-identity event history and recent-actions log
#[derive(Debug)]
pub struct RollingMemory {
    conversations: DashMap<Identity, VecDeque<MemoryEvent>>,
    recent_actions: Mutex<VecDeque<String>>,
    horizon: Duration,
    capacity: usize,
    clock: SharedClock,
}

impl Default for RollingMemory {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_HORIZON_SECS),
            DEFAULT_RECENT_ACTIONS,
        )
    }
}

impl RollingMemory {
    /// Create with a horizon and recent-actions capacity
    #[must_use]
    pub fn new(horizon: Duration, capacity: usize) -> Self {
        Self::with_clock(horizon, capacity, Arc::new(SystemClock))
    }

    /// Create with an explicit clock
    #[must_use]
    pub fn with_clock(horizon: Duration, capacity: usize, clock: SharedClock) -> Self {
        Self {
            conversations: DashMap::new(),
            recent_actions: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            horizon,
            capacity,
            clock,
        }
    }

    fn prune(&self, queue: &mut VecDeque<MemoryEvent>, now: DateTime<Utc>) {
        let cutoff = now - self.horizon;
        while queue.front().is_some_and(|e| e.timestamp < cutoff) {
            queue.pop_front();
        }
    }

    /// Remember a message from `identity`
    pub fn add_message(&self, identity: Identity, content: impl Into<String>) {
        let now = self.clock.now();
        let mut queue = self.conversations.entry(identity).or_default();
        self.prune(&mut queue, now);
        queue.push_back(MemoryEvent {
            timestamp: now,
            content: content.into(),
        });
    }

    /// Unexpired messages from `identity`, oldest first
    #[must_use]
    pub fn recall(&self, identity: Identity) -> Vec<String> {
        let now = self.clock.now();
        let Some(mut queue) = self.conversations.get_mut(&identity) else {
            return Vec::new();
        };
        self.prune(&mut queue, now);
        queue.iter().map(|e| e.content.clone()).collect()
    }

    /// Record an action summary, evicting the oldest on overflow
    pub fn add_action(&self, summary: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut actions = self.recent_actions.lock();
        while actions.len() >= self.capacity {
            actions.pop_front();
        }
        actions.push_back(summary.into());
    }

    /// Up to `limit` most recent action summaries, oldest first
    #[must_use]
    pub fn recent_actions(&self, limit: usize) -> Vec<String> {
        let actions = self.recent_actions.lock();
        let skip = actions.len().saturating_sub(limit);
        actions.iter().skip(skip).cloned().collect()
    }

    /// Copy of everything still held, with expired events pruned first
    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        let now = self.clock.now();
        let mut conversations = BTreeMap::new();
        for mut entry in self.conversations.iter_mut() {
            self.prune(&mut entry, now);
            if !entry.is_empty() {
                conversations.insert(*entry.key(), entry.iter().cloned().collect());
            }
        }
        MemorySnapshot {
            conversations,
            recent_actions: self.recent_actions.lock().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;

    fn memory_with_clock() -> (RollingMemory, ManualClock) {
        let clock = ManualClock::default();
        let memory = RollingMemory::with_clock(
            Duration::seconds(DEFAULT_HORIZON_SECS),
            3,
            Arc::new(clock.clone()),
        );
        (memory, clock)
    }

    #[test]
    fn events_expire_after_horizon() {
        let (memory, clock) = memory_with_clock();
        let who = Identity(7);
        memory.add_message(who, "hello");

        clock.advance_secs(3599);
        assert_eq!(memory.recall(who), vec!["hello"]);

        clock.advance_secs(2);
        assert!(memory.recall(who).is_empty());
    }

    #[test]
    fn identities_are_isolated() {
        let (memory, _) = memory_with_clock();
        memory.add_message(Identity(1), "a");
        memory.add_message(Identity(2), "b");
        assert_eq!(memory.recall(Identity(1)), vec!["a"]);
        assert!(memory.recall(Identity(3)).is_empty());
    }

    #[test]
    fn recent_actions_evict_oldest() {
        let (memory, _) = memory_with_clock();
        for n in 0..5 {
            memory.add_action(format!("action {n}"));
        }
        assert_eq!(
            memory.recent_actions(10),
            vec!["action 2", "action 3", "action 4"]
        );
        assert_eq!(memory.recent_actions(1), vec!["action 4"]);
    }

    #[test]
    fn snapshot_drops_expired_identities() {
        let (memory, clock) = memory_with_clock();
        memory.add_message(Identity(1), "old");
        clock.advance_secs(4000);
        memory.add_message(Identity(2), "new");
        let snapshot = memory.snapshot();
        assert_eq!(snapshot.conversations.len(), 1);
        assert!(snapshot.conversations.contains_key(&Identity(2)));
    }
}
