use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::message::StoredMessage;
use crate::queue::QueueEntry;

/// Snapshots expire seven days after creation, as in the emulated service.
pub(crate) const SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Metadata for a subscription snapshot.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub name: String,
    /// The subscription whose state was captured.
    pub subscription: String,
    /// The topic of that subscription.
    pub topic: String,
    pub expire_time: SystemTime,
}

/// A captured subscription state: what was still deliverable (attempt
/// counters included) and what had been acked. Message payloads are shared
/// by reference, so a snapshot pins its messages past queue retention.
#[derive(Clone, Default)]
pub(crate) struct SnapshotData {
    pub deliverable: Vec<QueueEntry>,
    pub acked: Vec<Arc<StoredMessage>>,
}

pub(crate) struct SnapshotState {
    pub info: Snapshot,
    pub data: SnapshotData,
}

impl SnapshotState {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.info.expire_time
    }
}
