//! Per-subscription lease table.
//!
//! Every delivered message gets a lease keyed by a fresh ack-id. Leases are
//! settled by ack or nack, extended by modack, or expired by the dispatcher
//! tick. Settling removes the lease outright, so any later settle on the
//! same ack-id observes `Invalid` and an acked message can never be
//! redelivered, stream restarts included.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write;
use std::time::Instant;

use rand::RngCore;

use crate::queue::QueueEntry;

/// An outstanding delivery.
#[derive(Debug)]
pub(crate) struct Lease {
    pub ack_id: String,
    pub entry: QueueEntry,
    pub deadline: Instant,
    /// Streaming session the message was delivered on, if any.
    pub session: Option<u64>,
}

struct ExpiryEntry {
    deadline: Instant,
    ack_id: String,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.ack_id == other.ack_id
    }
}

impl Eq for ExpiryEntry {}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.ack_id.cmp(&self.ack_id))
    }
}

#[derive(Default)]
pub(crate) struct AckTracker {
    leases: HashMap<String, Lease>,
    /// Deadline index over `leases`. Entries are lazily deleted: an entry is
    /// stale when its deadline no longer matches the lease (modack) or the
    /// lease is gone (settled).
    expiry: BinaryHeap<ExpiryEntry>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a lease for `entry` and returns the new ack-id.
    pub fn lease(&mut self, entry: QueueEntry, deadline: Instant, session: Option<u64>) -> String {
        let ack_id = generate_ack_id();
        self.expiry.push(ExpiryEntry {
            deadline,
            ack_id: ack_id.clone(),
        });
        self.leases.insert(
            ack_id.clone(),
            Lease {
                ack_id: ack_id.clone(),
                entry,
                deadline,
                session,
            },
        );
        ack_id
    }

    /// Removes and returns the lease, or `None` when the id is unknown or
    /// already settled.
    pub fn take(&mut self, ack_id: &str) -> Option<Lease> {
        self.leases.remove(ack_id)
    }

    /// Moves the lease deadline. Returns false when the id is unknown.
    pub fn extend(&mut self, ack_id: &str, deadline: Instant) -> bool {
        match self.leases.get_mut(ack_id) {
            None => false,
            Some(lease) => {
                lease.deadline = deadline;
                self.expiry.push(ExpiryEntry {
                    deadline,
                    ack_id: ack_id.to_string(),
                });
                true
            }
        }
    }

    /// Removes and returns every lease whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<Lease> {
        let mut expired = Vec::new();
        while self.expiry.peek().is_some_and(|e| e.deadline <= now) {
            let candidate = self.expiry.pop().unwrap();
            let due = self
                .leases
                .get(&candidate.ack_id)
                .is_some_and(|lease| lease.deadline == candidate.deadline);
            if due {
                expired.push(self.leases.remove(&candidate.ack_id).unwrap());
            }
        }
        expired
    }

    /// Removes and returns all outstanding leases (seek, shutdown).
    pub fn drain(&mut self) -> Vec<Lease> {
        self.expiry.clear();
        self.leases.drain().map(|(_, lease)| lease).collect()
    }

    /// Removes leases for which `predicate` holds (retention pruning).
    pub fn remove_where(&mut self, predicate: impl Fn(&Lease) -> bool) -> Vec<Lease> {
        let expired: Vec<String> = self
            .leases
            .values()
            .filter(|l| predicate(l))
            .map(|l| l.ack_id.clone())
            .collect();
        expired.into_iter().map(|id| self.leases.remove(&id).unwrap()).collect()
    }

    /// Clones the queue entries of all outstanding leases (snapshot capture).
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.leases.values().map(|l| l.entry.clone()).collect()
    }

    pub fn ack_ids_for_session(&self, session: u64) -> Vec<String> {
        self.leases
            .values()
            .filter(|l| l.session == Some(session))
            .map(|l| l.ack_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.leases.len()
    }
}

/// 128 bits of OS-seeded randomness, hex encoded. Ack ids must not be
/// guessable across subscriptions.
fn generate_ack_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(32), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
