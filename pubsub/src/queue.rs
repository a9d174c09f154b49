//! Per-subscription deliverable queue.
//!
//! Messages without an ordering key live in a single FIFO; messages with a
//! key live in per-key sub-FIFOs. A key is blocked while one of its messages
//! is leased to a consumer or parked in the backoff hold set, which is what
//! yields strict per-key delivery order. Across keys no order is guaranteed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::message::StoredMessage;

/// A message as seen by one subscription, with its delivery attempt counter.
#[derive(Clone, Debug)]
pub(crate) struct QueueEntry {
    pub message: Arc<StoredMessage>,
    pub attempts: u32,
}

impl QueueEntry {
    pub fn new(message: Arc<StoredMessage>) -> Self {
        Self { message, attempts: 0 }
    }

    pub fn ordering_key(&self) -> Option<&str> {
        let key = self.message.message.ordering_key.as_str();
        (!key.is_empty()).then_some(key)
    }
}

struct HeldEntry {
    release_at: Instant,
    seq: u64,
    entry: QueueEntry,
}

impl PartialEq for HeldEntry {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl Eq for HeldEntry {}

impl PartialOrd for HeldEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeldEntry {
    // Reversed so the BinaryHeap pops the earliest release first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.release_at, other.seq).cmp(&(self.release_at, self.seq))
    }
}

#[derive(Default)]
pub(crate) struct DeliverableQueue {
    /// Whether the subscription enables message ordering. When false,
    /// ordering keys are ignored and everything is one FIFO.
    ordered: bool,
    fifo: VecDeque<QueueEntry>,
    keyed: HashMap<String, VecDeque<QueueEntry>>,
    /// Keys with a leased or backoff-held message.
    blocked: HashSet<String>,
    /// Keys whose head is deliverable, in arrival order.
    ready: VecDeque<String>,
    ready_set: HashSet<String>,
    held: BinaryHeap<HeldEntry>,
    held_seq: u64,
}

impl DeliverableQueue {
    pub fn new(ordered: bool) -> Self {
        Self {
            ordered,
            ..Self::default()
        }
    }

    fn key_of<'a>(&self, entry: &'a QueueEntry) -> Option<&'a str> {
        if self.ordered {
            entry.ordering_key()
        } else {
            None
        }
    }

    /// Appends a freshly published message.
    pub fn push(&mut self, message: Arc<StoredMessage>) {
        self.enqueue_tail(QueueEntry::new(message));
    }

    fn enqueue_tail(&mut self, entry: QueueEntry) {
        match self.key_of(&entry) {
            Some(key) => {
                let key = key.to_string();
                self.keyed.entry(key.clone()).or_default().push_back(entry);
                self.mark_ready(key);
            }
            None => self.fifo.push_back(entry),
        }
    }

    /// Returns a nacked message to the queue: head of its key sub-FIFO so
    /// per-key order is preserved, tail of the global FIFO otherwise.
    pub fn requeue(&mut self, entry: QueueEntry) {
        match self.key_of(&entry) {
            Some(key) => {
                let key = key.to_string();
                self.keyed.entry(key.clone()).or_default().push_front(entry);
                self.blocked.remove(&key);
                self.mark_ready(key);
            }
            None => self.fifo.push_back(entry),
        }
    }

    /// Parks a message until `release_at`; its ordering key stays blocked.
    pub fn hold(&mut self, entry: QueueEntry, release_at: Instant) {
        if let Some(key) = self.key_of(&entry) {
            self.blocked.insert(key.to_string());
        }
        self.held_seq += 1;
        self.held.push(HeldEntry {
            release_at,
            seq: self.held_seq,
            entry,
        });
    }

    /// Moves every hold whose release time has passed back into the queue.
    pub fn release_due(&mut self, now: Instant) -> usize {
        let mut released = 0;
        while self.held.peek().is_some_and(|h| h.release_at <= now) {
            let held = self.held.pop().unwrap();
            self.requeue(held.entry);
            released += 1;
        }
        released
    }

    /// The next message `pop_next` would return, without taking it.
    pub fn peek_next(&self) -> Option<&QueueEntry> {
        if let Some(entry) = self.fifo.front() {
            return Some(entry);
        }
        let key = self.ready.front()?;
        self.keyed.get(key).and_then(VecDeque::front)
    }

    /// Pops the next deliverable message, blocking its ordering key.
    pub fn pop_next(&mut self) -> Option<QueueEntry> {
        if let Some(entry) = self.fifo.pop_front() {
            return Some(entry);
        }
        while let Some(key) = self.ready.pop_front() {
            self.ready_set.remove(&key);
            let Some(queue) = self.keyed.get_mut(&key) else {
                continue;
            };
            let Some(entry) = queue.pop_front() else {
                continue;
            };
            if queue.is_empty() {
                self.keyed.remove(&key);
            }
            self.blocked.insert(key);
            return Some(entry);
        }
        None
    }

    /// Unblocks `key` after its in-flight message settled for good.
    pub fn settle_key(&mut self, key: &str) {
        self.blocked.remove(key);
        self.mark_ready(key.to_string());
    }

    fn mark_ready(&mut self, key: String) {
        if self.blocked.contains(&key) {
            return;
        }
        if !self.keyed.get(&key).is_some_and(|q| !q.is_empty()) {
            return;
        }
        if self.ready_set.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    pub fn has_deliverable(&self) -> bool {
        !self.fifo.is_empty() || !self.ready.is_empty()
    }

    /// Removes every entry matching `predicate` (retention pruning, seek).
    /// Keys whose held message is removed become deliverable again.
    pub fn remove_where(&mut self, predicate: impl Fn(&QueueEntry) -> bool) -> Vec<QueueEntry> {
        let mut removed = Vec::new();

        let mut kept = VecDeque::with_capacity(self.fifo.len());
        for entry in self.fifo.drain(..) {
            if predicate(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.fifo = kept;

        for queue in self.keyed.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if predicate(&entry) {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        self.keyed.retain(|_, q| !q.is_empty());

        let mut held = BinaryHeap::with_capacity(self.held.len());
        for h in self.held.drain() {
            if predicate(&h.entry) {
                if let Some(key) = h.entry.ordering_key() {
                    self.blocked.remove(key);
                }
                removed.push(h.entry);
            } else {
                held.push(h);
            }
        }
        self.held = held;

        self.rebuild_ready();
        removed
    }

    fn rebuild_ready(&mut self) {
        self.ready.clear();
        self.ready_set.clear();
        let keys: Vec<String> = self.keyed.keys().cloned().collect();
        for key in keys {
            self.mark_ready(key);
        }
    }

    /// Clones the queue contents in delivery order, hold set included.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.fifo.iter().cloned().collect();
        let mut keys: Vec<&String> = self.keyed.keys().collect();
        keys.sort();
        for key in keys {
            entries.extend(self.keyed[key].iter().cloned());
        }
        let mut held: Vec<&HeldEntry> = self.held.iter().collect();
        held.sort_by_key(|h| (h.release_at, h.seq));
        entries.extend(held.iter().map(|h| h.entry.clone()));
        entries
    }

    /// Replaces the queue contents, dropping all blocked and held state.
    pub fn restore(&mut self, entries: Vec<QueueEntry>) {
        self.fifo.clear();
        self.keyed.clear();
        self.blocked.clear();
        self.ready.clear();
        self.ready_set.clear();
        self.held.clear();
        for entry in entries {
            self.enqueue_tail(entry);
        }
    }
}
