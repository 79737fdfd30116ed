//! Bounded, deduplicating FIFO of deferred requests
//!
//! Entries are keyed (by question id for investigations); pushing a key that
//! is already queued is a no-op. When full, the overflow policy either evicts
//! the oldest entry or rejects the newcomer. Both outcomes are reported to the
//! caller so nothing is lost silently.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Identity used for deduplication
pub trait QueueKey {
    fn queue_key(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest entry to make room
    #[default]
    EvictOldest,
    /// Refuse the new entry
    Reject,
}

#[derive(Debug, PartialEq)]
pub enum Enqueued<T> {
    Added { position: usize },
    Duplicate,
    AddedWithEviction { position: usize, evicted: T },
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupQueue<T> {
    capacity: usize,
    policy: OverflowPolicy,
    entries: VecDeque<T>,
}

impl<T: QueueKey> DedupQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            entries: VecDeque::new(),
        }
    }

    /// Rebuild from persisted entries, keeping the first of any duplicate key
    /// and the newest `capacity` entries
    pub fn from_entries(capacity: usize, policy: OverflowPolicy, entries: Vec<T>) -> Self {
        let mut queue = Self::new(capacity, policy);
        for entry in entries {
            if queue.contains(entry.queue_key()) {
                continue;
            }
            if queue.entries.len() == queue.capacity {
                queue.entries.pop_front();
            }
            queue.entries.push_back(entry);
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.queue_key() == key)
    }

    pub fn push(&mut self, item: T) -> Enqueued<T> {
        if self.contains(item.queue_key()) {
            return Enqueued::Duplicate;
        }
        if self.entries.len() < self.capacity {
            self.entries.push_back(item);
            return Enqueued::Added {
                position: self.entries.len() - 1,
            };
        }
        match self.policy {
            OverflowPolicy::Reject => Enqueued::Rejected,
            OverflowPolicy::EvictOldest => match self.entries.pop_front() {
                Some(evicted) => {
                    self.entries.push_back(item);
                    Enqueued::AddedWithEviction {
                        position: self.entries.len() - 1,
                        evicted,
                    }
                }
                None => Enqueued::Rejected,
            },
        }
    }

    /// Oldest entry
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.queue_key() == key)
    }
}

impl<T: Clone> DedupQueue<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
