use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Command, SeekRequest, SettleAction};
use crate::status::{RetrySetting, Status};
use crate::subscriber::{validate_extension_seconds, AckResponse, MessageStream, ReceivedMessage, SubscribeConfig};
use crate::util::{resource_id, run_call};

/// Push delivery settings. An empty endpoint means pull mode.
#[derive(Clone, Debug, Default)]
pub struct PushConfig {
    pub push_endpoint: String,
    /// Opaque attributes handed to the push hook with each delivery.
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct DeadLetterPolicy {
    /// Fully qualified topic that receives messages which exhausted their
    /// delivery attempts.
    pub dead_letter_topic: String,
    /// Between 5 and 100; zero selects the default of 5.
    pub max_delivery_attempts: i32,
}

impl DeadLetterPolicy {
    pub(crate) fn max_attempts(&self) -> u32 {
        if self.max_delivery_attempts == 0 {
            5
        } else {
            self.max_delivery_attempts as u32
        }
    }
}

/// Redelivery backoff applied on nack and lease expiry.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    pub minimum_backoff: Option<Duration>,
    pub maximum_backoff: Option<Duration>,
}

impl RetryPolicy {
    pub(crate) fn minimum_backoff(&self) -> Duration {
        self.minimum_backoff.unwrap_or(Duration::from_secs(10))
    }

    pub(crate) fn maximum_backoff(&self) -> Duration {
        self.maximum_backoff.unwrap_or(Duration::from_secs(600))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExpirationPolicy {
    /// Delete the subscription after this much subscriber inactivity.
    /// `None` means the subscription never expires.
    pub ttl: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    pub push_config: Option<PushConfig>,
    /// 10 to 600 seconds; zero selects the default of 10.
    pub ack_deadline_seconds: i32,
    /// 10 minutes to 7 days; unset selects the default of 7 days.
    pub message_retention_duration: Option<Duration>,
    pub labels: HashMap<String, String>,
    pub enable_message_ordering: bool,
    pub expiration_policy: Option<ExpirationPolicy>,
    /// Attribute filter source; empty matches everything.
    pub filter: String,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    /// Set by the broker when the topic is deleted.
    pub detached: bool,
    pub enable_exactly_once_delivery: bool,
}

const MIN_RETENTION: Duration = Duration::from_secs(10 * 60);
const MAX_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MAX_BACKOFF: Duration = Duration::from_secs(600);

impl SubscriptionConfig {
    pub(crate) fn ack_deadline(&self) -> Duration {
        if self.ack_deadline_seconds == 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(self.ack_deadline_seconds as u64)
        }
    }

    pub(crate) fn retention(&self) -> Duration {
        self.message_retention_duration.unwrap_or(MAX_RETENTION)
    }

    pub(crate) fn expiration_ttl(&self) -> Option<Duration> {
        self.expiration_policy.as_ref().and_then(|p| p.ttl)
    }

    pub(crate) fn validate(&self) -> Result<(), Status> {
        if self.ack_deadline_seconds != 0 && !(10..=600).contains(&self.ack_deadline_seconds) {
            return Err(Status::invalid_argument(format!(
                "ack deadline must be between 10 and 600 seconds: {}",
                self.ack_deadline_seconds
            )));
        }
        if let Some(retention) = self.message_retention_duration {
            if !(MIN_RETENTION..=MAX_RETENTION).contains(&retention) {
                return Err(Status::invalid_argument(format!(
                    "message retention must be between 10 minutes and 7 days: {retention:?}"
                )));
            }
        }
        if let Some(policy) = &self.dead_letter_policy {
            crate::util::parse_resource_name(&policy.dead_letter_topic, "topics")?;
            if policy.max_delivery_attempts != 0 && !(5..=100).contains(&policy.max_delivery_attempts) {
                return Err(Status::invalid_argument(format!(
                    "max delivery attempts must be between 5 and 100: {}",
                    policy.max_delivery_attempts
                )));
            }
        }
        if let Some(policy) = &self.retry_policy {
            if policy.minimum_backoff() > MAX_BACKOFF || policy.maximum_backoff() > MAX_BACKOFF {
                return Err(Status::invalid_argument("retry backoff must not exceed 600 seconds"));
            }
            if policy.minimum_backoff() > policy.maximum_backoff() {
                return Err(Status::invalid_argument(
                    "minimum backoff must not exceed maximum backoff",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SubscriptionConfigToUpdate {
    pub push_config: Option<PushConfig>,
    pub ack_deadline_seconds: Option<i32>,
    pub message_retention_duration: Option<Duration>,
    pub labels: Option<HashMap<String, String>>,
    pub expiration_policy: Option<ExpirationPolicy>,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Where a [`seek`](Subscription::seek) resets delivery state to.
#[derive(Clone, Debug)]
pub enum SeekTarget {
    /// Fully qualified snapshot name.
    Snapshot(String),
    /// Redeliver everything published at or after this time; everything
    /// before it counts as acked.
    Time(SystemTime),
}

pub struct ReceiveConfig {
    pub worker_count: usize,
    pub subscriber_config: SubscribeConfig,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            subscriber_config: SubscribeConfig::default(),
        }
    }
}

/// Subscription is a reference to a broker subscription.
#[derive(Clone)]
pub struct Subscription {
    fqsn: String,
    broker: std::sync::Arc<crate::broker::BrokerInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("fqsn", &self.fqsn).finish()
    }
}

impl Subscription {
    pub(crate) fn new(fqsn: String, broker: std::sync::Arc<crate::broker::BrokerInner>) -> Self {
        Self { fqsn, broker }
    }

    /// id returns the unique identifier of the subscription within its project.
    pub fn id(&self) -> String {
        resource_id(&self.fqsn).to_string()
    }

    /// fully_qualified_name returns the globally unique printable name of the subscription.
    pub fn fully_qualified_name(&self) -> &str {
        self.fqsn.as_str()
    }

    /// create creates the subscription on the topic named by `fqtn`.
    pub async fn create(
        &self,
        fqtn: &str,
        cfg: SubscriptionConfig,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<(), Status> {
        let broker = self.broker.clone();
        let fqsn = self.fqsn.clone();
        let fqtn = fqtn.to_string();
        run_call(cancel, retry.and_then(|r| r.timeout), async move {
            broker.create_subscription_entry(&fqsn, &fqtn, cfg)
        })
        .await
    }

    /// delete deletes the subscription. Outstanding leases are invalidated.
    pub async fn delete(&self, cancel: Option<CancellationToken>, retry: Option<RetrySetting>) -> Result<(), Status> {
        let broker = self.broker.clone();
        let fqsn = self.fqsn.clone();
        run_call(cancel, retry.and_then(|r| r.timeout), async move {
            broker.delete_subscription_entry(&fqsn).await
        })
        .await
    }

    /// exists reports whether the subscription exists on the broker.
    pub async fn exists(&self, cancel: Option<CancellationToken>, _retry: Option<RetrySetting>) -> Result<bool, Status> {
        crate::util::check_cancelled(&cancel)?;
        match self.broker.subscription_state(&self.fqsn) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == crate::status::Code::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// config fetches the current configuration and the topic name.
    pub async fn config(
        &self,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<(String, SubscriptionConfig), Status> {
        crate::util::check_cancelled(&cancel)?;
        let state = self.broker.subscription_state(&self.fqsn)?;
        let mut config = state.config.read().clone();
        config.detached = state.detached.load(std::sync::atomic::Ordering::Acquire);
        Ok((state.topic.clone(), config))
    }

    /// update changes the subscription according to the fields set in
    /// `updating` and returns the new configuration.
    pub async fn update(
        &self,
        updating: SubscriptionConfigToUpdate,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<(String, SubscriptionConfig), Status> {
        crate::util::check_cancelled(&cancel)?;
        self.broker.update_subscription_entry(&self.fqsn, updating)
    }

    /// pull returns up to `max_messages` leased messages, or none after a
    /// short wait when the subscription is idle. It never blocks indefinitely.
    pub async fn pull(
        &self,
        max_messages: i32,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<Vec<ReceivedMessage>, Status> {
        if max_messages <= 0 {
            return Err(Status::invalid_argument(format!(
                "max_messages must be positive: {max_messages}"
            )));
        }
        let state = self.broker.subscription_state(&self.fqsn)?;
        let (reply, rx) = oneshot::channel();
        state
            .tx
            .send(Command::Pull { max_messages, reply })
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.fqsn)))?;
        let fqsn = self.fqsn.clone();
        run_call(cancel, retry.and_then(|r| r.timeout), async move {
            rx.await
                .map_err(|_| Status::not_found(format!("subscription is gone: {fqsn}")))
        })
        .await
    }

    /// subscribe opens a streaming-pull session and returns its message
    /// stream. Messages flow under the session's flow-control budget until
    /// the stream is dropped or disposed.
    pub async fn subscribe(&self, opt: Option<SubscribeConfig>) -> Result<MessageStream, Status> {
        let config = opt.unwrap_or_default();
        if let Some(seconds) = config.stream_ack_deadline_seconds {
            if !(10..=600).contains(&seconds) {
                return Err(Status::invalid_argument(format!(
                    "stream ack deadline must be between 10 and 600 seconds: {seconds}"
                )));
            }
        }
        let state = self.broker.subscription_state(&self.fqsn)?;
        let (sender, receiver) = async_channel::unbounded();
        state
            .tx
            .send(Command::Attach { config, sender })
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.fqsn)))?;
        Ok(MessageStream::new(receiver))
    }

    /// receive calls f with the outstanding messages from the subscription.
    /// It blocks until the cancellation token is cancelled.
    pub async fn receive<F>(
        &self,
        f: impl Fn(ReceivedMessage, CancellationToken) -> F + Send + 'static + Sync + Clone,
        cancel: CancellationToken,
        config: Option<ReceiveConfig>,
    ) -> Result<(), Status>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let op = config.unwrap_or_default();
        let mut workers = Vec::with_capacity(op.worker_count);
        for _ in 0..op.worker_count {
            let stream = self.subscribe(Some(op.subscriber_config.clone())).await?;
            let f_clone = f.clone();
            let cancel_clone = cancel.clone();
            let name = self.fqsn.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel_clone.cancelled() => break,
                        message = stream.recv() => match message {
                            Ok(message) => f_clone(message, cancel_clone.clone()).await,
                            Err(_) => break,
                        }
                    }
                }
                tracing::trace!("stop message receiver : {name}");
                stream.dispose().await;
            }));
        }
        cancel.cancelled().await;

        // wait for all the workers to drain and nack what they did not process
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    /// acknowledge settles the given ack ids; fire-and-forget.
    pub async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), Status> {
        self.settle(ack_ids, SettleAction::Ack).await.map(|_| ())
    }

    /// modify_ack_deadline extends the leases behind `ack_ids`; zero seconds
    /// nacks them.
    pub async fn modify_ack_deadline(&self, ack_ids: Vec<String>, ack_deadline_seconds: i32) -> Result<(), Status> {
        validate_extension_seconds(ack_deadline_seconds)?;
        self.settle(ack_ids, SettleAction::Extend(ack_deadline_seconds))
            .await
            .map(|_| ())
    }

    /// acknowledge_with_response reports the per-id settlement outcome, for
    /// subscriptions with exactly-once delivery enabled.
    pub async fn acknowledge_with_response(&self, ack_ids: Vec<String>) -> Result<Vec<AckResponse>, Status> {
        self.settle(ack_ids, SettleAction::Ack).await
    }

    pub async fn modify_ack_deadline_with_response(
        &self,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> Result<Vec<AckResponse>, Status> {
        validate_extension_seconds(ack_deadline_seconds)?;
        self.settle(ack_ids, SettleAction::Extend(ack_deadline_seconds)).await
    }

    async fn settle(&self, ack_ids: Vec<String>, action: SettleAction) -> Result<Vec<AckResponse>, Status> {
        let state = self.broker.subscription_state(&self.fqsn)?;
        let (tx, rx) = oneshot::channel();
        state
            .tx
            .send(Command::Settle {
                ack_ids,
                action,
                reply: Some(tx),
            })
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.fqsn)))?;
        rx.await
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.fqsn)))
    }

    /// seek resets the subscription to a snapshot or to a point in time.
    ///
    /// Seeking to a time fails with `FailedPrecondition` while messages are
    /// outstanding: close or drain consumers first, otherwise their acks
    /// would surface unknown-ack errors.
    pub async fn seek(
        &self,
        target: SeekTarget,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<(), Status> {
        let state = self.broker.subscription_state(&self.fqsn)?;
        let request = match &target {
            SeekTarget::Time(time) => SeekRequest::Time(*time),
            SeekTarget::Snapshot(name) => SeekRequest::Restore(self.broker.snapshot_data(name)?),
        };
        let (tx, rx) = oneshot::channel();
        state
            .tx
            .send(Command::Seek { request, reply: tx })
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.fqsn)))?;
        let fqsn = self.fqsn.clone();
        run_call(cancel, retry.and_then(|r| r.timeout), async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Status::not_found(format!("subscription is gone: {fqsn}"))),
            }
        })
        .await
    }

    /// modify_push_config switches the subscription between push and pull
    /// delivery; an empty endpoint selects pull.
    pub async fn modify_push_config(&self, push_config: PushConfig) -> Result<(), Status> {
        let state = self.broker.subscription_state(&self.fqsn)?;
        state.config.write().push_config = Some(push_config);
        Ok(())
    }
}
