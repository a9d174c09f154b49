use async_channel::Receiver;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerInner;
use crate::flow::{FlowControlSettings, FlowController, FlowPermit};
use crate::message::PubsubMessage;
use crate::status::Status;
use crate::util::ToUsize;

pub(crate) struct ReservedMessage {
    pub producer: oneshot::Sender<Result<String, Status>>,
    pub message: PubsubMessage,
    /// Flow-control slots, released once the message is admitted or failed.
    pub permit: Option<FlowPermit>,
}

pub(crate) enum PublishItem {
    Message(ReservedMessage),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PublisherConfig {
    /// worker count. each worker batches independently
    pub workers: usize,
    /// interval for flush bundle message
    pub flush_interval: Duration,
    /// max bundle size to flush
    pub bundle_size: usize,
    /// max bundle bytes to flush
    pub bundle_bytes: usize,
    /// publish-side flow control; unlimited when unset
    pub flow_control: Option<FlowControlSettings>,
    /// must be set to publish messages that carry an ordering key
    pub enable_message_ordering: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            flush_interval: Duration::from_millis(10),
            bundle_size: 100,
            bundle_bytes: 1024 * 1024,
            flow_control: None,
            enable_message_ordering: false,
        }
    }
}

pub struct Awaiter {
    consumer: oneshot::Receiver<Result<String, Status>>,
}

impl Awaiter {
    pub(crate) fn new(consumer: oneshot::Receiver<Result<String, Status>>) -> Self {
        Self { consumer }
    }

    /// Blocks until the broker assigns the message id or fails the publish.
    pub async fn get(self, cancel: Option<CancellationToken>) -> Result<String, Status> {
        let onetime = self.consumer;
        let awaited = match cancel {
            Some(cancel) => {
                select! {
                    _ = cancel.cancelled() => return Err(Status::cancelled("cancelled")),
                    v = onetime => v
                }
            }
            None => onetime.await,
        };
        match awaited {
            Ok(v) => v,
            Err(_e) => Err(Status::cancelled("closed")),
        }
    }
}

/// Publisher is a batching scheduler for a topic's publish flow.
///
/// Messages without an ordering key are batched in arrival order across a
/// worker pool. Messages with the same ordering key always land on the same
/// worker, so at most one batch per key is in flight and per-key publish
/// order is preserved. When a publish for a key fails, the key pauses: every
/// later publish for it fails with the same status until
/// [`resume_publishing`](Publisher::resume_publishing).
#[derive(Clone)]
pub struct Publisher {
    ordering_senders: Arc<Vec<async_channel::Sender<PublishItem>>>,
    senders: Arc<Vec<async_channel::Sender<PublishItem>>>,
    next_worker: Arc<std::sync::atomic::AtomicUsize>,
    tasks: Arc<Mutex<Tasks>>,
    fqtn: String,
    broker: Arc<BrokerInner>,
    paused_keys: Arc<parking_lot::Mutex<HashMap<String, Status>>>,
    flow: Option<Arc<FlowController>>,
    ordering_enabled: bool,
}

impl Publisher {
    pub(crate) fn new(fqtn: String, broker: Arc<BrokerInner>, config: Option<PublisherConfig>) -> Self {
        let config = config.unwrap_or_default();
        let workers = config.workers.max(1);
        let mut receivers = Vec::with_capacity(2 * workers);
        let mut senders = Vec::with_capacity(workers);
        let mut ordering_senders = Vec::with_capacity(workers);

        // for non-ordering key message, round-robin across workers
        for _ in 0..workers {
            tracing::trace!("start non-ordering publisher : {}", fqtn.clone());
            let (sender, receiver) = async_channel::unbounded::<PublishItem>();
            receivers.push(receiver);
            senders.push(sender);
        }

        // for ordering key message, one worker per key hash
        for _ in 0..workers {
            tracing::trace!("start ordering publisher : {}", fqtn.clone());
            let (sender, receiver) = async_channel::unbounded::<PublishItem>();
            receivers.push(receiver);
            ordering_senders.push(sender);
        }

        let paused_keys = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let flow = config.flow_control.as_ref().map(|s| Arc::new(FlowController::new(s)));
        Self {
            senders: Arc::new(senders),
            next_worker: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            ordering_senders: Arc::new(ordering_senders),
            tasks: Arc::new(Mutex::new(Tasks::new(
                fqtn.clone(),
                broker.clone(),
                paused_keys.clone(),
                receivers,
                &config,
            ))),
            fqtn,
            broker,
            paused_keys,
            flow,
            ordering_enabled: config.enable_message_ordering,
        }
    }

    /// publish publishes msg to the topic synchronously, skipping batching.
    pub async fn publish_immediately(
        &self,
        messages: Vec<PubsubMessage>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<String>, Status> {
        crate::util::check_cancelled(&cancel)?;
        for message in &messages {
            self.admit(message)?;
        }
        self.broker.publish_admitted(self.fqtn.as_str(), messages)
    }

    /// publish publishes msg to the topic asynchronously. Messages are
    /// batched and sent according to the PublisherConfig. publish itself only
    /// blocks under flow-control pressure.
    ///
    /// publish returns an Awaiter which will be ready when the message has
    /// been assigned an id (or has failed admission).
    pub async fn publish(&self, message: PubsubMessage) -> Awaiter {
        let (producer, consumer) = oneshot::channel();
        if self.senders[0].is_closed() {
            drop(producer);
            return Awaiter::new(consumer);
        }

        if let Err(status) = self.admit(&message) {
            // Any failed publish for an ordering key pauses the key.
            if !message.ordering_key.is_empty() {
                self.paused_keys
                    .lock()
                    .entry(message.ordering_key.clone())
                    .or_insert_with(|| status.clone());
            }
            let _ = producer.send(Err(status));
            return Awaiter::new(consumer);
        }

        let permit = match &self.flow {
            None => None,
            Some(flow) => match flow.acquire(message.size()).await {
                Ok(permit) => Some(permit),
                Err(status) => {
                    let _ = producer.send(Err(status));
                    return Awaiter::new(consumer);
                }
            },
        };

        let reserved = ReservedMessage {
            producer,
            message,
            permit,
        };
        if reserved.message.ordering_key.is_empty() {
            let index = self.next_worker.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.senders.len();
            let _ = self.senders[index].send(PublishItem::Message(reserved)).await;
        } else {
            let key = reserved.message.ordering_key.as_str().to_usize();
            let index = key % self.ordering_senders.len();
            let _ = self.ordering_senders[index].send(PublishItem::Message(reserved)).await;
        }
        Awaiter::new(consumer)
    }

    /// Per-message admission: bounds, ordering preconditions, paused keys
    /// and the topic's schema hook.
    fn admit(&self, message: &PubsubMessage) -> Result<(), Status> {
        message.validate_for_publish()?;
        if !message.ordering_key.is_empty() {
            if !self.ordering_enabled {
                return Err(Status::invalid_argument(
                    "cannot publish a message with an ordering key: message ordering is not enabled",
                ));
            }
            if let Some(status) = self.paused_keys.lock().get(&message.ordering_key) {
                return Err(status.clone());
            }
        }
        self.broker.validate_for_topic(self.fqtn.as_str(), message)
    }

    /// Forces every worker to flush its bundle; returns once each published
    /// message so far has been admitted and fanned out.
    pub async fn flush(&self) {
        let mut waiters = Vec::with_capacity(self.senders.len() + self.ordering_senders.len());
        for sender in self.senders.iter().chain(self.ordering_senders.iter()) {
            let (tx, rx) = oneshot::channel();
            if sender.send(PublishItem::Flush(tx)).await.is_ok() {
                waiters.push(rx);
            }
        }
        for waiter in waiters {
            let _ = waiter.await;
        }
    }

    /// Lifts the pause on `ordering_key` after a failed publish.
    pub fn resume_publishing(&self, ordering_key: &str) {
        self.paused_keys.lock().remove(ordering_key);
    }

    pub async fn shutdown(&mut self) {
        self.close_channels();
        self.tasks.lock().await.done().await;
    }

    /// Closes the intake channels without waiting for the workers; they
    /// flush their remaining bundles and stop on their own.
    pub(crate) fn close_channels(&self) {
        for s in self.senders.iter().chain(self.ordering_senders.iter()) {
            s.close();
        }
    }
}

struct Tasks {
    inner: Option<Vec<JoinHandle<()>>>,
}

impl Tasks {
    pub fn new(
        topic: String,
        broker: Arc<BrokerInner>,
        paused_keys: Arc<parking_lot::Mutex<HashMap<String, Status>>>,
        receivers: Vec<async_channel::Receiver<PublishItem>>,
        config: &PublisherConfig,
    ) -> Self {
        let tasks = receivers
            .into_iter()
            .map(|receiver| {
                Self::run_task(
                    receiver,
                    broker.clone(),
                    topic.clone(),
                    paused_keys.clone(),
                    config.flush_interval,
                    config.bundle_size,
                    config.bundle_bytes,
                )
            })
            .collect();

        Self { inner: Some(tasks) }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task(
        receiver: Receiver<PublishItem>,
        broker: Arc<BrokerInner>,
        topic: String,
        paused_keys: Arc<parking_lot::Mutex<HashMap<String, Status>>>,
        flush_interval: Duration,
        bundle_size: usize,
        bundle_bytes: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(flush_interval);
            let mut bundle = VecDeque::<ReservedMessage>::new();
            let mut bundled_bytes = 0;
            loop {
                select! {
                    item = receiver.recv() => match item {
                        Ok(PublishItem::Message(message)) => {
                            bundled_bytes += message.message.size();
                            bundle.push_back(message);
                            if bundle.len() >= bundle_size || bundled_bytes >= bundle_bytes {
                                tracing::trace!("maximum buffer {} : {}", bundle.len(), topic);
                                Self::flush(&broker, topic.as_str(), &mut bundle, &paused_keys);
                                bundled_bytes = 0;
                                debug_assert!(bundle.is_empty());
                            }
                        }
                        Ok(PublishItem::Flush(done)) => {
                            Self::flush(&broker, topic.as_str(), &mut bundle, &paused_keys);
                            bundled_bytes = 0;
                            let _ = done.send(());
                        }
                        Err(_) => break,
                    },
                    _ = interval_timer.tick() => {
                        if !bundle.is_empty() {
                            tracing::trace!("elapsed: flush buffer : {}", topic);
                            Self::flush(&broker, topic.as_str(), &mut bundle, &paused_keys);
                            bundled_bytes = 0;
                            debug_assert!(bundle.is_empty());
                        }
                    }
                }
            }

            tracing::trace!("stop publisher : {}", topic);
            while let Ok(item) = receiver.try_recv() {
                match item {
                    PublishItem::Message(message) => bundle.push_back(message),
                    PublishItem::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            if !bundle.is_empty() {
                tracing::trace!("flush rest buffer : {}", topic);
                Self::flush(&broker, topic.as_str(), &mut bundle, &paused_keys);
            }
        })
    }

    /// flush hands the buffered messages to the broker, which assigns ids and
    /// enqueues them in every matching subscription before returning.
    fn flush(
        broker: &Arc<BrokerInner>,
        topic: &str,
        bundle: &mut VecDeque<ReservedMessage>,
        paused_keys: &Arc<parking_lot::Mutex<HashMap<String, Status>>>,
    ) {
        if bundle.is_empty() {
            return;
        }
        let mut data = Vec::<PubsubMessage>::with_capacity(bundle.len());
        let mut callback = Vec::<oneshot::Sender<Result<String, Status>>>::with_capacity(bundle.len());
        let mut permits = Vec::with_capacity(bundle.len());

        while let Some(r) = bundle.pop_front() {
            data.push(r.message);
            callback.push(r.producer);
            permits.push(r.permit);
        }
        let ordering_keys: Vec<String> = data.iter().map(|m| m.ordering_key.clone()).collect();

        let result = broker.publish_admitted(topic, data);

        // notify to receivers
        match result {
            Ok(message_ids) => {
                for (i, p) in callback.into_iter().enumerate() {
                    let message_id = &message_ids[i];
                    if p.send(Ok(message_id.to_string())).is_err() {
                        tracing::error!("failed to notify : id={message_id}");
                    }
                }
            }
            Err(status) => {
                // A failed publish pauses its ordering keys; they stay
                // paused until resume_publishing.
                let mut paused = paused_keys.lock();
                for key in ordering_keys {
                    if !key.is_empty() {
                        paused.entry(key).or_insert_with(|| status.clone());
                    }
                }
                drop(paused);
                for p in callback.into_iter() {
                    if p.send(Err(status.clone())).is_err() {
                        tracing::error!("failed to notify : status={:?}", status.code());
                    }
                }
            }
        };
        drop(permits);
    }

    /// done waits for all the workers finish.
    pub async fn done(&mut self) {
        if let Some(tasks) = self.inner.take() {
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}
