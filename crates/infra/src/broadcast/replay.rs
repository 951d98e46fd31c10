use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use datlake_events::{BroadcastEvent, Topic};

/// Bounded history of recent broadcast events.
///
/// FIFO eviction: once full, every push drops the oldest event.
#[derive(Debug)]
pub struct ReplayBuffer {
    events: VecDeque<Arc<BroadcastEvent>>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an event; returns the evicted one, if any.
    pub fn push(&mut self, event: Arc<BroadcastEvent>) -> Option<Arc<BroadcastEvent>> {
        let evicted = if self.events.len() == self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// The last `limit` buffered events on `topics`, oldest first.
    pub fn recent(&self, topics: &BTreeSet<Topic>, limit: usize) -> Vec<Arc<BroadcastEvent>> {
        let mut picked: Vec<_> = self
            .events
            .iter()
            .rev()
            .filter(|e| topics.contains(&e.topic()))
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
