//! Bounded, ordered, deduplicating window of delivered signals.

use crate::types::{Signal, SignalSide};
use std::collections::{HashSet, VecDeque};

/// Composite identity used purely for set membership. Records without an
/// id or side still dedup on the remaining fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    id: Option<String>,
    ts: i64,
    symbol: String,
    side: Option<SignalSide>,
}

impl DedupKey {
    pub fn of(signal: &Signal) -> Self {
        Self {
            id: signal.id.clone(),
            ts: signal.ts,
            symbol: signal.symbol.clone(),
            side: signal.side,
        }
    }
}

/// Newest-first window capped at `capacity`. The dedup key set is allowed
/// to outlive window eviction up to 2x capacity so that a record evicted
/// from the window and replayed shortly after is still recognized, then
/// trimmed FIFO to keep memory bounded.
#[derive(Debug)]
pub struct DedupBuffer {
    capacity: usize,
    window: VecDeque<Signal>,
    seen: HashSet<DedupKey>,
    seen_order: VecDeque<DedupKey>,
}

impl DedupBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity * 2),
            seen_order: VecDeque::with_capacity(capacity * 2),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Inserts the signal at the front unless its key was already seen.
    /// Returns whether the signal was accepted.
    pub fn offer(&mut self, signal: Signal) -> bool {
        let key = DedupKey::of(&signal);
        if self.seen.contains(&key) {
            return false;
        }

        self.seen.insert(key.clone());
        self.seen_order.push_back(key);
        while self.seen_order.len() > self.capacity * 2 {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.window.push_front(signal);
        while self.window.len() > self.capacity {
            self.window.pop_back();
        }
        true
    }

    pub fn latest(&self) -> Option<&Signal> {
        self.window.front()
    }

    /// Insertion-ordered view, newest first.
    pub fn snapshot(&self) -> Vec<Signal> {
        self.window.iter().cloned().collect()
    }

    pub fn snapshot_where<F>(&self, predicate: F) -> Vec<Signal>
    where
        F: Fn(&Signal) -> bool,
    {
        self.window
            .iter()
            .filter(|signal| predicate(signal))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.seen.clear();
        self.seen_order.clear();
    }
}
