//! Per-subscription dispatcher.
//!
//! Each subscription is driven by exactly one task that owns its queue, its
//! lease table and its timers. Everything that touches that state — publish
//! fan-in, pull requests, streaming sessions, ack traffic, seeks, snapshot
//! capture — arrives as a [`Command`] on the dispatcher channel and runs
//! serialized, which is what makes per-key ordering, lease accounting and
//! exactly-once settle responses hold without locks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::broker::{BrokerInner, PushRequest, SubscriptionState};
use crate::message::{
    StoredMessage, DEAD_LETTER_DELIVERY_COUNT_ATTRIBUTE, DEAD_LETTER_SOURCE_SUBSCRIPTION_ATTRIBUTE,
};
use crate::queue::{DeliverableQueue, QueueEntry};
use crate::snapshot::SnapshotData;
use crate::status::Status;
use crate::subscriber::{AckResponse, ReceivedMessage, SubscribeConfig};
use crate::subscription::RetryPolicy;
use crate::tracker::AckTracker;

/// Timer resolution for lease expiry, backoff release and pruning.
const TICK: Duration = Duration::from_millis(100);
/// How long an empty pull waits for a message before returning no results.
const PULL_WAIT: Duration = Duration::from_millis(100);
/// Outstanding push deliveries per subscription.
const MAX_PUSH_OUTSTANDING: usize = 100;
/// A push endpoint that has not answered within this window counts as failed.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) enum SettleAction {
    Ack,
    Nack,
    /// Move the lease deadline; zero seconds is equivalent to a nack.
    Extend(i32),
}

/// A seek with the snapshot already resolved by the caller.
pub(crate) enum SeekRequest {
    Time(SystemTime),
    Restore(SnapshotData),
}

pub(crate) enum Command {
    Deliver(Vec<Arc<StoredMessage>>),
    Pull {
        max_messages: i32,
        reply: oneshot::Sender<Vec<ReceivedMessage>>,
    },
    Attach {
        config: SubscribeConfig,
        sender: async_channel::Sender<ReceivedMessage>,
    },
    Settle {
        ack_ids: Vec<String>,
        action: SettleAction,
        reply: Option<oneshot::Sender<Vec<AckResponse>>>,
    },
    Seek {
        request: SeekRequest,
        reply: oneshot::Sender<Result<(), Status>>,
    },
    CaptureSnapshot {
        reply: oneshot::Sender<SnapshotData>,
    },
    PushResult {
        ack_id: String,
        code: Option<u16>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Session {
    id: u64,
    sender: async_channel::Sender<ReceivedMessage>,
    ack_deadline: Duration,
    max_outstanding_messages: i64,
    max_outstanding_bytes: i64,
    allow_excess: bool,
    outstanding_messages: i64,
    outstanding_bytes: i64,
}

impl Session {
    fn has_budget_for(&self, size: usize) -> bool {
        let messages_ok = self.max_outstanding_messages <= 0 || self.outstanding_messages < self.max_outstanding_messages;
        let bytes_ok = self.max_outstanding_bytes <= 0
            || self.outstanding_bytes + size as i64 <= self.max_outstanding_bytes
            || self.outstanding_messages == 0
            || self.allow_excess;
        messages_ok && bytes_ok
    }
}

struct PendingPull {
    max_messages: i32,
    reply: oneshot::Sender<Vec<ReceivedMessage>>,
    deadline: Instant,
}

pub(crate) struct Dispatcher {
    state: Arc<SubscriptionState>,
    broker: Weak<BrokerInner>,
    rx: mpsc::UnboundedReceiver<Command>,
    /// Handed to delivered messages so their settles come back to this loop.
    tx: mpsc::UnboundedSender<Command>,
    queue: DeliverableQueue,
    tracker: AckTracker,
    sessions: Vec<Session>,
    next_session_id: u64,
    rr_cursor: usize,
    pending_pulls: VecDeque<PendingPull>,
    /// Acked messages retained for seek-to-time, pruned with the queue.
    acked_history: Vec<Arc<StoredMessage>>,
    push_outstanding: usize,
    last_activity: Instant,
}

impl Dispatcher {
    pub fn spawn(
        state: Arc<SubscriptionState>,
        broker: Weak<BrokerInner>,
        rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let ordered = state.config.read().enable_message_ordering;
        let tx = state.tx.clone();
        let dispatcher = Dispatcher {
            state,
            broker,
            rx,
            tx,
            queue: DeliverableQueue::new(ordered),
            tracker: AckTracker::new(),
            sessions: Vec::new(),
            next_session_id: 0,
            rr_cursor: 0,
            pending_pulls: VecDeque::new(),
            acked_history: Vec::new(),
            push_outstanding: 0,
            last_activity: Instant::now(),
        };
        tokio::spawn(dispatcher.run());
    }

    async fn run(mut self) {
        tracing::debug!("start dispatcher: {}", self.state.name);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tick.tick() => {
                    if self.on_tick() {
                        break;
                    }
                }
            }
            self.dispatch();
        }
        tracing::debug!("stop dispatcher: {}", self.state.name);
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Deliver(messages) => {
                for message in messages {
                    tracing::trace!("message queued: sub={} id={}", self.state.name, message.message.message_id);
                    self.queue.push(message);
                }
            }
            Command::Pull { max_messages, reply } => {
                self.last_activity = Instant::now();
                self.pending_pulls.push_back(PendingPull {
                    max_messages,
                    reply,
                    deadline: Instant::now() + PULL_WAIT,
                });
            }
            Command::Attach { config, sender } => {
                self.last_activity = Instant::now();
                self.next_session_id += 1;
                let ack_deadline = config
                    .stream_ack_deadline_seconds
                    .map(|s| Duration::from_secs(s as u64))
                    .unwrap_or_else(|| self.state.config.read().ack_deadline());
                self.sessions.push(Session {
                    id: self.next_session_id,
                    sender,
                    ack_deadline,
                    max_outstanding_messages: config.max_outstanding_messages,
                    max_outstanding_bytes: config.max_outstanding_bytes,
                    allow_excess: config.allow_excess_messages,
                    outstanding_messages: 0,
                    outstanding_bytes: 0,
                });
            }
            Command::Settle { ack_ids, action, reply } => {
                self.last_activity = Instant::now();
                let responses: Vec<AckResponse> = ack_ids.iter().map(|id| self.settle_one(id, &action)).collect();
                if let Some(reply) = reply {
                    let _ = reply.send(responses);
                }
            }
            Command::Seek { request, reply } => {
                let _ = reply.send(self.handle_seek(request));
            }
            Command::CaptureSnapshot { reply } => {
                let _ = reply.send(self.capture());
            }
            Command::PushResult { ack_id, code } => {
                self.push_outstanding = self.push_outstanding.saturating_sub(1);
                self.handle_push_result(&ack_id, code);
            }
            Command::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    fn settle_one(&mut self, ack_id: &str, action: &SettleAction) -> AckResponse {
        match action {
            SettleAction::Ack => match self.tracker.take(ack_id) {
                Some(lease) => {
                    self.release_session_budget(&lease);
                    self.finish_ack(lease);
                    AckResponse::Success
                }
                None => AckResponse::Invalid,
            },
            SettleAction::Nack => match self.tracker.take(ack_id) {
                Some(lease) => {
                    self.release_session_budget(&lease);
                    self.requeue_entry(lease.entry);
                    AckResponse::Success
                }
                None => AckResponse::Invalid,
            },
            SettleAction::Extend(0) => self.settle_one(ack_id, &SettleAction::Nack),
            SettleAction::Extend(seconds) => {
                let deadline = Instant::now() + Duration::from_secs(*seconds as u64);
                if self.tracker.extend(ack_id, deadline) {
                    AckResponse::Success
                } else {
                    AckResponse::Invalid
                }
            }
        }
    }

    /// Completes a successful ack: the message leaves the subscription for
    /// good and its ordering key unblocks. The lease is already gone from
    /// the tracker, so any later settle on its ack-id observes `Invalid`
    /// and the message cannot be redelivered, stream restarts included.
    fn finish_ack(&mut self, lease: crate::tracker::Lease) {
        if let Some(key) = lease.entry.ordering_key() {
            let key = key.to_string();
            self.queue.settle_key(&key);
        }
        self.acked_history.push(lease.entry.message);
    }

    /// Routes a nacked or expired message: dead-letter once the attempt
    /// budget is spent, otherwise back into the queue, through the retry
    /// backoff hold when the subscription has a retry policy.
    fn requeue_entry(&mut self, entry: QueueEntry) {
        let config = self.state.config.read();
        let dead_letter = config.dead_letter_policy.clone();
        let retry = config.retry_policy.clone();
        drop(config);

        if let Some(policy) = dead_letter {
            if entry.attempts >= policy.max_attempts() {
                self.forward_dead_letter(entry, &policy.dead_letter_topic);
                return;
            }
        }
        match retry {
            Some(policy) => {
                let delay = retry_backoff(&policy, entry.attempts);
                self.queue.hold(entry, Instant::now() + delay);
            }
            None => self.queue.requeue(entry),
        }
    }

    /// Best-effort forward to the dead-letter topic. The message is settled
    /// on this subscription either way; a missing topic or failed publish is
    /// logged and the message dropped.
    fn forward_dead_letter(&mut self, entry: QueueEntry, dead_letter_topic: &str) {
        if let Some(key) = entry.ordering_key() {
            let key = key.to_string();
            self.queue.settle_key(&key);
        }
        let mut message = entry.message.message.clone();
        message.attributes.insert(
            DEAD_LETTER_SOURCE_SUBSCRIPTION_ATTRIBUTE.to_string(),
            self.state.name.clone(),
        );
        message.attributes.insert(
            DEAD_LETTER_DELIVERY_COUNT_ATTRIBUTE.to_string(),
            entry.attempts.to_string(),
        );
        match self.broker.upgrade() {
            None => tracing::error!("dead-letter forward after broker shutdown: {}", self.state.name),
            Some(broker) => match broker.publish_admitted(dead_letter_topic, vec![message]) {
                Ok(ids) => tracing::debug!(
                    "dead-lettered message: sub={} topic={dead_letter_topic} id={}",
                    self.state.name,
                    ids[0]
                ),
                Err(e) => tracing::error!(
                    "dead-letter publish failed, dropping message: sub={} topic={dead_letter_topic}: {e}",
                    self.state.name
                ),
            },
        }
        self.acked_history.push(entry.message);
    }

    fn handle_push_result(&mut self, ack_id: &str, code: Option<u16>) {
        let Some(lease) = self.tracker.take(ack_id) else {
            // The lease expired while the endpoint was working; the expiry
            // path already requeued the message.
            return;
        };
        match code {
            Some(code) if (200..300).contains(&code) => self.finish_ack(lease),
            Some(code) if (400..500).contains(&code) => {
                let dead_letter = self.state.config.read().dead_letter_policy.clone();
                match dead_letter {
                    Some(policy) => self.forward_dead_letter(lease.entry, &policy.dead_letter_topic),
                    None => {
                        tracing::error!(
                            "push endpoint rejected message with {code} and no dead-letter topic is set, dropping: {}",
                            self.state.name
                        );
                        self.finish_ack(lease);
                    }
                }
            }
            _ => self.requeue_entry(lease.entry),
        }
    }

    fn handle_seek(&mut self, request: SeekRequest) -> Result<(), Status> {
        match request {
            SeekRequest::Time(time) => {
                if !self.tracker.is_empty() {
                    return Err(Status::failed_precondition(format!(
                        "subscription has {} outstanding messages; settle or release them before seeking",
                        self.tracker.outstanding()
                    )));
                }
                // Everything published before the target is treated as acked.
                let dropped = self.queue.remove_where(|e| e.message.published_at < time);
                self.acked_history.extend(dropped.into_iter().map(|e| e.message));

                // Acked messages at or past the target become deliverable
                // again, with fresh attempt counters.
                let mut resurrect = Vec::new();
                self.acked_history.retain(|m| {
                    if m.published_at >= time {
                        resurrect.push(m.clone());
                        false
                    } else {
                        true
                    }
                });
                resurrect.sort_by_key(|m| m.published_at);
                for message in resurrect {
                    self.queue.push(message);
                }
                Ok(())
            }
            SeekRequest::Restore(data) => {
                for lease in self.tracker.drain() {
                    self.release_session_budget(&lease);
                }
                self.queue.restore(data.deliverable);
                self.acked_history = data.acked;
                Ok(())
            }
        }
    }

    fn capture(&mut self) -> SnapshotData {
        // Outstanding (leased) messages are unacked, so they belong to the
        // captured deliverable state ahead of the queued backlog.
        let mut deliverable = self.tracker.entries();
        deliverable.sort_by_key(|e| e.message.published_at);
        deliverable.extend(self.queue.entries());
        SnapshotData {
            deliverable,
            acked: self.acked_history.clone(),
        }
    }

    /// Runs timers: backoff release, lease expiry, retention pruning, pull
    /// deadlines and idle expiration. Returns true when the subscription
    /// expired and deleted itself.
    fn on_tick(&mut self) -> bool {
        let now = Instant::now();

        self.queue.release_due(now);

        for lease in self.tracker.expired(now) {
            tracing::trace!("lease expired: sub={} ack_id={}", self.state.name, lease.ack_id);
            self.release_session_budget(&lease);
            self.requeue_entry(lease.entry);
        }

        self.prune_retention(now);

        // Expired pulls reply with no messages rather than blocking forever.
        for pull in std::mem::take(&mut self.pending_pulls) {
            if pull.deadline <= now {
                let _ = pull.reply.send(Vec::new());
            } else if !pull.reply.is_closed() {
                self.pending_pulls.push_back(pull);
            }
        }

        let expiration_ttl = self.state.config.read().expiration_ttl();
        if let Some(ttl) = expiration_ttl {
            if self.last_activity.elapsed() > ttl && self.tracker.is_empty() {
                tracing::debug!("subscription expired after {ttl:?} idle: {}", self.state.name);
                if let Some(broker) = self.broker.upgrade() {
                    broker.remove_subscription_entry(&self.state.name, &self.state.topic);
                }
                self.shutdown();
                return true;
            }
        }
        false
    }

    fn prune_retention(&mut self, now: Instant) {
        let retention = self.state.config.read().retention();
        let too_old = |admitted_at: Instant| now.duration_since(admitted_at) > retention;

        let dropped = self.queue.remove_where(|e| too_old(e.message.admitted_at));
        for lease in self.tracker.remove_where(|l| too_old(l.entry.message.admitted_at)) {
            self.release_session_budget(&lease);
            if let Some(key) = lease.entry.ordering_key() {
                let key = key.to_string();
                self.queue.settle_key(&key);
            }
        }
        if !dropped.is_empty() {
            tracing::debug!("retention dropped {} messages: {}", dropped.len(), self.state.name);
        }
        self.acked_history.retain(|m| !too_old(m.admitted_at));
    }

    /// Hands deliverable messages to whoever can take them: parked pulls
    /// first, then streaming sessions round-robin, or the push endpoint when
    /// the subscription is configured for push.
    fn dispatch(&mut self) {
        self.reap_closed_sessions();
        if self.push_active() {
            self.serve_push();
            return;
        }
        self.serve_pulls();
        self.serve_streams();
    }

    fn push_active(&self) -> bool {
        self.state
            .config
            .read()
            .push_config
            .as_ref()
            .is_some_and(|c| !c.push_endpoint.is_empty())
            && self.broker.upgrade().is_some_and(|b| b.push_handler().is_some())
    }

    fn serve_pulls(&mut self) {
        while !self.pending_pulls.is_empty() && self.queue.has_deliverable() {
            let pull = self.pending_pulls.pop_front().unwrap();
            let deadline = self.state.config.read().ack_deadline();
            let mut batch = Vec::new();
            while (batch.len() as i32) < pull.max_messages {
                let Some(entry) = self.queue.pop_next() else {
                    break;
                };
                batch.push(self.lease_message(entry, deadline, None));
            }
            if pull.reply.send(batch).is_err() {
                // The caller went away; the leases stand and the messages
                // redeliver after their deadline.
                tracing::trace!("pull caller gone: {}", self.state.name);
            }
        }
    }

    fn serve_streams(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        'outer: loop {
            let size = match self.queue.peek_next() {
                Some(next) => next.message.size,
                None => break,
            };
            let count = self.sessions.len();
            for offset in 0..count {
                let idx = (self.rr_cursor + offset) % count;
                if !self.sessions[idx].has_budget_for(size) {
                    continue;
                }
                let entry = self.queue.pop_next().unwrap();
                let deadline = self.sessions[idx].ack_deadline;
                let session_id = self.sessions[idx].id;
                let message = self.lease_message(entry, deadline, Some(session_id));
                let session = &mut self.sessions[idx];
                session.outstanding_messages += 1;
                session.outstanding_bytes += size as i64;
                if session.sender.try_send(message).is_err() {
                    // Receiver dropped between reap and send; tear the
                    // session down and let the lease expiry redeliver.
                    self.teardown_session(idx);
                    if self.sessions.is_empty() {
                        break 'outer;
                    }
                    continue 'outer;
                }
                self.rr_cursor = idx + 1;
                continue 'outer;
            }
            // No session has budget for the head message.
            break;
        }
    }

    fn serve_push(&mut self) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        let Some(handler) = broker.push_handler() else {
            return;
        };
        let config = self.state.config.read();
        let Some(push) = config.push_config.clone() else {
            return;
        };
        let deadline = config.ack_deadline();
        let has_dead_letter = config.dead_letter_policy.is_some();
        drop(config);

        while self.push_outstanding < MAX_PUSH_OUTSTANDING {
            let Some(mut entry) = self.queue.pop_next() else {
                break;
            };
            entry.attempts += 1;
            let attempts = entry.attempts;
            let message = entry.message.message.clone();
            let ack_id = self.tracker.lease(entry, Instant::now() + deadline, None);
            self.push_outstanding += 1;

            let request = PushRequest {
                endpoint: push.push_endpoint.clone(),
                subscription: self.state.name.clone(),
                message,
                attributes: push.attributes.clone(),
                delivery_attempt: has_dead_letter.then_some(attempts as usize),
            };
            let handler = handler.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let code = tokio::time::timeout(PUSH_TIMEOUT, handler.deliver(request)).await.ok();
                let _ = tx.send(Command::PushResult { ack_id, code });
            });
        }
    }

    fn lease_message(&mut self, mut entry: QueueEntry, deadline: Duration, session: Option<u64>) -> ReceivedMessage {
        entry.attempts += 1;
        let attempts = entry.attempts;
        let message = entry.message.message.clone();
        let has_dead_letter = self.state.config.read().dead_letter_policy.is_some();
        let ack_id = self.tracker.lease(entry, Instant::now() + deadline, session);
        tracing::trace!("message leased: sub={} ack_id={ack_id}", self.state.name);
        ReceivedMessage::new(
            self.state.name.clone(),
            self.tx.clone(),
            message,
            ack_id,
            has_dead_letter.then_some(attempts as usize),
        )
    }

    fn release_session_budget(&mut self, lease: &crate::tracker::Lease) {
        let Some(session_id) = lease.session else {
            return;
        };
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            session.outstanding_messages -= 1;
            session.outstanding_bytes -= lease.entry.message.size as i64;
        }
    }

    fn reap_closed_sessions(&mut self) {
        let mut idx = 0;
        while idx < self.sessions.len() {
            if self.sessions[idx].sender.is_closed() {
                self.teardown_session(idx);
            } else {
                idx += 1;
            }
        }
    }

    /// Invalidates a closed session. Outstanding leases are treated as
    /// nacks and requeued immediately, except in exactly-once mode where
    /// they run out their deadline to preserve at-most-once success.
    fn teardown_session(&mut self, idx: usize) {
        let session = self.sessions.remove(idx);
        tracing::debug!("streaming session closed: sub={} session={}", self.state.name, session.id);
        let eod = self.state.config.read().enable_exactly_once_delivery;
        if eod {
            return;
        }
        for ack_id in self.tracker.ack_ids_for_session(session.id) {
            if let Some(lease) = self.tracker.take(&ack_id) {
                self.requeue_entry(lease.entry);
            }
        }
    }

    fn shutdown(&mut self) {
        for session in self.sessions.drain(..) {
            session.sender.close();
        }
        for pull in self.pending_pulls.drain(..) {
            let _ = pull.reply.send(Vec::new());
        }
        self.tracker.drain();
    }
}

/// Exponential redelivery backoff: `min(minimum * 2^(attempts-1), maximum)`.
fn retry_backoff(policy: &RetryPolicy, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let delay = policy.minimum_backoff().saturating_mul(1u32 << exponent);
    delay.min(policy.maximum_backoff())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            minimum_backoff: Some(Duration::from_secs(10)),
            maximum_backoff: Some(Duration::from_secs(60)),
        };
        assert_eq!(retry_backoff(&policy, 1), Duration::from_secs(10));
        assert_eq!(retry_backoff(&policy, 2), Duration::from_secs(20));
        assert_eq!(retry_backoff(&policy, 3), Duration::from_secs(40));
        assert_eq!(retry_backoff(&policy, 4), Duration::from_secs(60));
        assert_eq!(retry_backoff(&policy, 40), Duration::from_secs(60));
    }
}
