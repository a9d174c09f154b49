use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerInner;
use crate::message::PubsubMessage;
use crate::publisher::{Awaiter, Publisher, PublisherConfig};
use crate::schema::SchemaSettings;
use crate::status::{Code, RetrySetting, Status};
use crate::subscription::Subscription;
use crate::util::{check_cancelled, resource_id};

const MIN_TOPIC_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_TOPIC_RETENTION: Duration = Duration::from_secs(31 * 24 * 60 * 60);

#[derive(Clone, Debug, Default)]
pub struct TopicConfig {
    pub labels: HashMap<String, String>,
    /// 24 hours to 31 days; unset selects the default of 7 days.
    pub message_retention_duration: Option<Duration>,
    /// When set, published payloads are validated against the schema.
    pub schema_settings: Option<SchemaSettings>,
    /// Default publishers created for this topic accept ordering keys.
    pub enable_message_ordering: bool,
}

impl TopicConfig {
    pub(crate) fn validate(&self) -> Result<(), Status> {
        if let Some(retention) = self.message_retention_duration {
            if !(MIN_TOPIC_RETENTION..=MAX_TOPIC_RETENTION).contains(&retention) {
                return Err(Status::invalid_argument(format!(
                    "topic message retention must be between 24 hours and 31 days: {retention:?}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TopicConfigToUpdate {
    pub labels: Option<HashMap<String, String>>,
    pub message_retention_duration: Option<Duration>,
    pub schema_settings: Option<SchemaSettings>,
}

/// Topic is a reference to a broker topic.
pub struct Topic {
    fqtn: String,
    broker: Arc<BrokerInner>,
    config: PublisherConfig,
    publisher: Mutex<Option<Publisher>>,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("fqtn", &self.fqtn).finish()
    }
}

impl Topic {
    pub(crate) fn new(fqtn: String, broker: Arc<BrokerInner>, config: Option<PublisherConfig>) -> Self {
        Self {
            fqtn,
            broker,
            config: config.unwrap_or_default(),
            publisher: Mutex::new(None),
        }
    }

    /// id returns the unique identifier of the topic within its project.
    pub fn id(&self) -> String {
        resource_id(&self.fqtn).to_string()
    }

    /// fully_qualified_name returns the printable globally unique name for the topic.
    pub fn fully_qualified_name(&self) -> &str {
        self.fqtn.as_str()
    }

    /// create creates the topic.
    pub async fn create(
        &self,
        cfg: Option<TopicConfig>,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<(), Status> {
        check_cancelled(&cancel)?;
        self.broker.create_topic_entry(&self.fqtn, cfg.unwrap_or_default())
    }

    /// delete deletes the topic. Its subscriptions survive detached: they
    /// take no new messages but can still be drained.
    pub async fn delete(&self, cancel: Option<CancellationToken>, _retry: Option<RetrySetting>) -> Result<(), Status> {
        check_cancelled(&cancel)?;
        self.close();
        self.broker.delete_topic_entry(&self.fqtn)
    }

    /// exists reports whether the topic exists on the broker.
    pub async fn exists(&self, cancel: Option<CancellationToken>, _retry: Option<RetrySetting>) -> Result<bool, Status> {
        check_cancelled(&cancel)?;
        if self.fqtn == "_deleted-topic_" {
            return Ok(false);
        }
        match self.broker.topic_config(&self.fqtn) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Code::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// get fetches the topic configuration. With `auto_create`, a missing
    /// topic is created with defaults and returned as if it existed.
    pub async fn get(
        &self,
        auto_create: bool,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<TopicConfig, Status> {
        check_cancelled(&cancel)?;
        match self.broker.topic_config(&self.fqtn) {
            Err(e) if e.code() == Code::NotFound && auto_create => {
                match self.broker.create_topic_entry(&self.fqtn, TopicConfig::default()) {
                    Ok(()) => {}
                    // Lost a creation race; the topic exists either way.
                    Err(e) if e.code() == Code::AlreadyExists => {}
                    Err(e) => return Err(e),
                }
                self.broker.topic_config(&self.fqtn)
            }
            other => other,
        }
    }

    /// config fetches the current topic configuration.
    pub async fn config(
        &self,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<TopicConfig, Status> {
        self.get(false, cancel, retry).await
    }

    /// update changes the topic according to the fields set in `updating`.
    pub async fn update(
        &self,
        updating: TopicConfigToUpdate,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<TopicConfig, Status> {
        check_cancelled(&cancel)?;
        self.broker.update_topic_entry(&self.fqtn, updating)
    }

    /// subscriptions returns the subscriptions attached to this topic.
    pub async fn subscriptions(
        &self,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<Vec<Subscription>, Status> {
        check_cancelled(&cancel)?;
        self.broker.list_topic_subscriptions(&self.fqtn).map(|names| {
            names
                .into_iter()
                .map(|name| Subscription::new(name, self.broker.clone()))
                .collect()
        })
    }

    /// new_publisher creates a batching publisher for this topic.
    ///
    /// Without an explicit config the publisher inherits the topic's
    /// message-ordering flag.
    pub fn new_publisher(&self, config: Option<PublisherConfig>) -> Publisher {
        let config = config.unwrap_or_else(|| {
            let mut config = self.config.clone();
            config.enable_message_ordering = config.enable_message_ordering
                || self
                    .broker
                    .topic_config(&self.fqtn)
                    .map(|c| c.enable_message_ordering)
                    .unwrap_or(false);
            config
        });
        Publisher::new(self.fqtn.clone(), self.broker.clone(), Some(config))
    }

    /// set_publish_options replaces the shared publisher's configuration.
    /// The previous publisher's workers flush what they had buffered and
    /// stop; publishes after this call use the new options.
    pub fn set_publish_options(&self, config: PublisherConfig) {
        let mut lock = self.publisher.lock();
        if let Some(old) = lock.take() {
            old.close_channels();
        }
        *lock = Some(Publisher::new(self.fqtn.clone(), self.broker.clone(), Some(config)));
    }

    /// publish publishes the message through this topic's shared publisher,
    /// creating it on first use.
    pub async fn publish(&self, message: PubsubMessage) -> Awaiter {
        let publisher = {
            let mut lock = self.publisher.lock();
            if lock.is_none() {
                *lock = Some(self.new_publisher(None));
            }
            lock.as_ref().unwrap().clone()
        };
        publisher.publish(message).await
    }

    /// publish_immediately publishes synchronously, skipping batching.
    pub async fn publish_immediately(
        &self,
        messages: Vec<PubsubMessage>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<String>, Status> {
        let publisher = {
            let mut lock = self.publisher.lock();
            if lock.is_none() {
                *lock = Some(self.new_publisher(None));
            }
            lock.as_ref().unwrap().clone()
        };
        publisher.publish_immediately(messages, cancel).await
    }

    /// flush forces the shared publisher's pending bundles out; on return
    /// every published message is enqueued in every matching subscription.
    pub async fn flush(&self) {
        let publisher = self.publisher.lock().as_ref().cloned();
        if let Some(publisher) = publisher {
            publisher.flush().await;
        }
    }

    /// resume_publishing lifts the pause on an ordering key after a failure.
    pub fn resume_publishing(&self, ordering_key: &str) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            publisher.resume_publishing(ordering_key);
        }
    }

    /// close stops the shared publisher's workers. Buffered messages are
    /// still flushed before the workers exit.
    pub fn close(&self) {
        let mut lock = self.publisher.lock();
        if let Some(publisher) = lock.take() {
            publisher.close_channels();
        }
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        self.close();
    }
}
