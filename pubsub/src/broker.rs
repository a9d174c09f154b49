use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Command, Dispatcher};
use crate::filter::Filter;
use crate::message::{PubsubMessage, StoredMessage};
use crate::schema::{self, Encoding, Schema, SchemaType, SchemaValidator};
use crate::snapshot::{Snapshot, SnapshotData, SnapshotState, SNAPSHOT_TTL};
use crate::status::{RetrySetting, Status};
use crate::subscription::{Subscription, SubscriptionConfig, SubscriptionConfigToUpdate};
use crate::topic::{Topic, TopicConfig, TopicConfigToUpdate};
use crate::util::{check_cancelled, parse_resource_name, validate_resource_id};

/// One push delivery handed to the injected push hook.
pub struct PushRequest {
    pub endpoint: String,
    pub subscription: String,
    pub message: PubsubMessage,
    /// The push config's opaque attributes.
    pub attributes: HashMap<String, String>,
    pub delivery_attempt: Option<usize>,
}

/// Outbound push delivery hook.
///
/// The broker does no HTTP itself: when a subscription has a push endpoint,
/// deliveries are handed to this hook and its HTTP-like status code decides
/// the outcome. 2xx acks, 4xx dead-letters immediately, anything else (or a
/// timeout) nacks with retry backoff.
pub trait PushHandler: Send + Sync + 'static {
    fn deliver(&self, request: PushRequest) -> Pin<Box<dyn Future<Output = u16> + Send + 'static>>;
}

#[derive(Default)]
pub struct BrokerConfig {
    pub push_handler: Option<Arc<dyn PushHandler>>,
    /// Extra schema validators, keyed by `SchemaType::validator_name`.
    /// Installed over the built-in JSON validator.
    pub schema_validators: HashMap<String, Arc<dyn SchemaValidator>>,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Zero returns everything.
    pub page_size: i32,
    pub page_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    /// Present when more items follow; feed it into the next call.
    pub next_page_token: Option<String>,
}

pub(crate) struct TopicState {
    pub config: RwLock<TopicConfig>,
    pub subscriptions: RwLock<BTreeSet<String>>,
}

pub(crate) struct SubscriptionState {
    pub name: String,
    pub topic: String,
    pub config: RwLock<SubscriptionConfig>,
    /// Compiled once at creation; immutable afterwards.
    pub filter: Option<Filter>,
    pub detached: AtomicBool,
    pub tx: mpsc::UnboundedSender<Command>,
}

impl SubscriptionState {
    fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(attributes))
    }
}

pub(crate) struct BrokerInner {
    topics: RwLock<BTreeMap<String, Arc<TopicState>>>,
    subscriptions: RwLock<BTreeMap<String, Arc<SubscriptionState>>>,
    schemas: RwLock<BTreeMap<String, Schema>>,
    snapshots: RwLock<BTreeMap<String, Arc<SnapshotState>>>,
    next_message_id: AtomicU64,
    /// Publish stamps are clamped to be non-decreasing so publish order and
    /// publish time never disagree, even under wall-clock regression.
    last_publish_time: Mutex<SystemTime>,
    push_handler: Option<Arc<dyn PushHandler>>,
    validators: HashMap<String, Arc<dyn SchemaValidator>>,
    /// Handed to dispatchers so they can reach the registry without keeping
    /// the broker alive.
    weak: std::sync::Weak<BrokerInner>,
}

impl BrokerInner {
    fn new(config: BrokerConfig) -> Arc<Self> {
        let mut validators = schema::default_validators();
        validators.extend(config.schema_validators);
        Arc::new_cyclic(|weak| Self {
            topics: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(BTreeMap::new()),
            schemas: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
            next_message_id: AtomicU64::new(1),
            last_publish_time: Mutex::new(SystemTime::UNIX_EPOCH),
            push_handler: config.push_handler,
            validators,
            weak: weak.clone(),
        })
    }

    pub fn push_handler(&self) -> Option<Arc<dyn PushHandler>> {
        self.push_handler.clone()
    }

    // ---- topics ----

    pub fn create_topic_entry(&self, name: &str, config: TopicConfig) -> Result<(), Status> {
        let (_, id) = parse_resource_name(name, "topics")?;
        validate_resource_id(id)?;
        config.validate()?;
        if let Some(settings) = &config.schema_settings {
            parse_resource_name(&settings.schema, "schemas")?;
            if !self.schemas.read().contains_key(&settings.schema) {
                return Err(Status::not_found(format!("schema not found: {}", settings.schema)));
            }
        }
        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Err(Status::already_exists(format!("topic already exists: {name}")));
        }
        topics.insert(
            name.to_string(),
            Arc::new(TopicState {
                config: RwLock::new(config),
                subscriptions: RwLock::new(BTreeSet::new()),
            }),
        );
        tracing::debug!("topic created: {name}");
        Ok(())
    }

    fn topic_state(&self, name: &str) -> Result<Arc<TopicState>, Status> {
        parse_resource_name(name, "topics")?;
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("topic not found: {name}")))
    }

    pub fn topic_config(&self, name: &str) -> Result<TopicConfig, Status> {
        Ok(self.topic_state(name)?.config.read().clone())
    }

    pub fn update_topic_entry(&self, name: &str, updating: TopicConfigToUpdate) -> Result<TopicConfig, Status> {
        let topic = self.topic_state(name)?;
        if let Some(settings) = &updating.schema_settings {
            parse_resource_name(&settings.schema, "schemas")?;
            if !self.schemas.read().contains_key(&settings.schema) {
                return Err(Status::not_found(format!("schema not found: {}", settings.schema)));
            }
        }
        let mut config = topic.config.write();
        if let Some(labels) = updating.labels {
            config.labels = labels;
        }
        if let Some(retention) = updating.message_retention_duration {
            let patched = TopicConfig {
                message_retention_duration: Some(retention),
                ..config.clone()
            };
            patched.validate()?;
            config.message_retention_duration = Some(retention);
        }
        if updating.schema_settings.is_some() {
            config.schema_settings = updating.schema_settings;
        }
        Ok(config.clone())
    }

    /// Removes the topic; attached subscriptions become detached and drain.
    pub fn delete_topic_entry(&self, name: &str) -> Result<(), Status> {
        parse_resource_name(name, "topics")?;
        let topic = self
            .topics
            .write()
            .remove(name)
            .ok_or_else(|| Status::not_found(format!("topic not found: {name}")))?;
        let attached = topic.subscriptions.read().clone();
        let subscriptions = self.subscriptions.read();
        for sub_name in attached {
            if let Some(state) = subscriptions.get(&sub_name) {
                state.detached.store(true, Ordering::Release);
                state.config.write().detached = true;
                tracing::debug!("subscription detached: {sub_name}");
            }
        }
        tracing::debug!("topic deleted: {name}");
        Ok(())
    }

    pub fn list_topics(&self, project: &str, options: ListOptions) -> ListPage<String> {
        let prefix = format!("projects/{project}/topics/");
        let names: Vec<String> = self
            .topics
            .read()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        paginate(names, |n| n.as_str(), options)
    }

    pub fn list_topic_subscriptions(&self, name: &str) -> Result<Vec<String>, Status> {
        Ok(self.topic_state(name)?.subscriptions.read().iter().cloned().collect())
    }

    // ---- publishing ----

    /// Admits pre-validated messages: assigns ids and publish times under a
    /// total order, then fans each message out to every attached,
    /// non-detached subscription whose filter matches. Synchronous, so the
    /// messages are enqueued everywhere before the call returns.
    pub fn publish_admitted(&self, topic_name: &str, messages: Vec<PubsubMessage>) -> Result<Vec<String>, Status> {
        let topic = self.topic_state(topic_name)?;

        // The stamp lock is held through the fan-out: enqueue order in every
        // subscription then agrees with id and publish-time order.
        let mut last = self.last_publish_time.lock();
        let now = SystemTime::now().max(*last);
        *last = now;
        let stored: Vec<Arc<StoredMessage>> = messages
            .into_iter()
            .map(|m| {
                let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
                Arc::new(StoredMessage::new(m, id, now))
            })
            .collect();
        let ids: Vec<String> = stored.iter().map(|m| m.message.message_id.clone()).collect();

        let attached = topic.subscriptions.read().clone();
        let subscriptions = self.subscriptions.read();
        for sub_name in attached {
            let Some(state) = subscriptions.get(&sub_name) else {
                continue;
            };
            if state.detached.load(Ordering::Acquire) {
                continue;
            }
            // A non-matching message is acked on the subscription's behalf:
            // it is simply never enqueued there.
            let matched: Vec<Arc<StoredMessage>> = stored
                .iter()
                .filter(|m| state.matches(&m.message.attributes))
                .cloned()
                .collect();
            if !matched.is_empty() && state.tx.send(Command::Deliver(matched)).is_err() {
                tracing::error!("delivery to stopped subscription: {sub_name}");
            }
        }
        tracing::trace!("published {} messages: {topic_name}", ids.len());
        Ok(ids)
    }

    /// The topic's pre-publish schema hook. Passing when the topic has no
    /// schema settings or no validator covers the schema type.
    pub fn validate_for_topic(&self, topic_name: &str, message: &PubsubMessage) -> Result<(), Status> {
        let Some(settings) = self.topic_state(topic_name)?.config.read().schema_settings.clone() else {
            return Ok(());
        };
        let schemas = self.schemas.read();
        let schema = schemas
            .get(&settings.schema)
            .ok_or_else(|| Status::invalid_argument(format!("schema was deleted: {}", settings.schema)))?;
        match self.validators.get(schema.schema_type.validator_name()) {
            None => Ok(()),
            Some(validator) => validator
                .validate_message(&schema.definition, &message.data, settings.encoding)
                .map_err(|e| Status::invalid_argument(format!("schema validation failed: {e}"))),
        }
    }

    // ---- subscriptions ----

    pub fn create_subscription_entry(
        &self,
        name: &str,
        topic_name: &str,
        config: SubscriptionConfig,
    ) -> Result<(), Status> {
        let (_, id) = parse_resource_name(name, "subscriptions")?;
        validate_resource_id(id)?;
        config.validate()?;
        let filter = if config.filter.is_empty() {
            None
        } else {
            Some(Filter::compile(&config.filter)?)
        };
        if let Some(policy) = &config.dead_letter_policy {
            // The broker's service account always has publish rights; only
            // existence is checked.
            self.topic_state(&policy.dead_letter_topic)
                .map_err(|_| Status::not_found(format!("dead letter topic not found: {}", policy.dead_letter_topic)))?;
        }
        let topic = self.topic_state(topic_name)?;

        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(name) {
            return Err(Status::already_exists(format!("subscription already exists: {name}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SubscriptionState {
            name: name.to_string(),
            topic: topic_name.to_string(),
            config: RwLock::new(config),
            filter,
            detached: AtomicBool::new(false),
            tx,
        });
        subscriptions.insert(name.to_string(), state.clone());
        drop(subscriptions);
        topic.subscriptions.write().insert(name.to_string());

        Dispatcher::spawn(state, self.weak.clone(), rx);
        tracing::debug!("subscription created: {name} on {topic_name}");
        Ok(())
    }

    pub fn subscription_state(&self, name: &str) -> Result<Arc<SubscriptionState>, Status> {
        parse_resource_name(name, "subscriptions")?;
        self.subscriptions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("subscription not found: {name}")))
    }

    pub fn update_subscription_entry(
        &self,
        name: &str,
        updating: SubscriptionConfigToUpdate,
    ) -> Result<(String, SubscriptionConfig), Status> {
        let state = self.subscription_state(name)?;
        if let Some(policy) = &updating.dead_letter_policy {
            self.topic_state(&policy.dead_letter_topic)
                .map_err(|_| Status::not_found(format!("dead letter topic not found: {}", policy.dead_letter_topic)))?;
        }
        let mut config = state.config.read().clone();
        if updating.push_config.is_some() {
            config.push_config = updating.push_config;
        }
        if let Some(v) = updating.ack_deadline_seconds {
            config.ack_deadline_seconds = v;
        }
        if updating.message_retention_duration.is_some() {
            config.message_retention_duration = updating.message_retention_duration;
        }
        if let Some(v) = updating.labels {
            config.labels = v;
        }
        if updating.expiration_policy.is_some() {
            config.expiration_policy = updating.expiration_policy;
        }
        if updating.dead_letter_policy.is_some() {
            config.dead_letter_policy = updating.dead_letter_policy;
        }
        if updating.retry_policy.is_some() {
            config.retry_policy = updating.retry_policy;
        }
        config.validate()?;
        *state.config.write() = config.clone();
        Ok((state.topic.clone(), config))
    }

    pub async fn delete_subscription_entry(&self, name: &str) -> Result<(), Status> {
        let state = {
            parse_resource_name(name, "subscriptions")?;
            self.subscriptions
                .write()
                .remove(name)
                .ok_or_else(|| Status::not_found(format!("subscription not found: {name}")))?
        };
        if let Some(topic) = self.topics.read().get(&state.topic) {
            topic.subscriptions.write().remove(name);
        }
        let (tx, rx) = oneshot::channel();
        if state.tx.send(Command::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        tracing::debug!("subscription deleted: {name}");
        Ok(())
    }

    /// Registry cleanup for a subscription that expired idle; called from
    /// its own dispatcher, which then stops itself.
    pub fn remove_subscription_entry(&self, name: &str, topic_name: &str) {
        self.subscriptions.write().remove(name);
        if let Some(topic) = self.topics.read().get(topic_name) {
            topic.subscriptions.write().remove(name);
        }
    }

    pub fn list_subscriptions(&self, project: &str, options: ListOptions) -> ListPage<String> {
        let prefix = format!("projects/{project}/subscriptions/");
        let names: Vec<String> = self
            .subscriptions
            .read()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        paginate(names, |n| n.as_str(), options)
    }

    // ---- schemas ----

    pub fn create_schema_entry(&self, name: &str, schema_type: SchemaType, definition: String) -> Result<Schema, Status> {
        let (_, id) = parse_resource_name(name, "schemas")?;
        validate_resource_id(id)?;
        schema::validate_definition(&self.validators, schema_type, &definition)?;
        let mut schemas = self.schemas.write();
        if schemas.contains_key(name) {
            return Err(Status::already_exists(format!("schema already exists: {name}")));
        }
        let schema = Schema {
            name: name.to_string(),
            schema_type,
            definition,
            create_time: SystemTime::now(),
        };
        schemas.insert(name.to_string(), schema.clone());
        Ok(schema)
    }

    pub fn get_schema_entry(&self, name: &str) -> Result<Schema, Status> {
        parse_resource_name(name, "schemas")?;
        self.schemas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("schema not found: {name}")))
    }

    pub fn delete_schema_entry(&self, name: &str) -> Result<(), Status> {
        parse_resource_name(name, "schemas")?;
        self.schemas
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Status::not_found(format!("schema not found: {name}")))
    }

    pub fn list_schemas(&self, project: &str, options: ListOptions) -> ListPage<Schema> {
        let prefix = format!("projects/{project}/schemas/");
        let schemas: Vec<Schema> = self
            .schemas
            .read()
            .values()
            .filter(|s| s.name.starts_with(&prefix))
            .cloned()
            .collect();
        paginate(schemas, |s| s.name.as_str(), options)
    }

    pub fn validate_schema_definition(&self, schema_type: SchemaType, definition: &str) -> Result<(), Status> {
        schema::validate_definition(&self.validators, schema_type, definition)
    }

    pub fn validate_message_entry(&self, schema_name: &str, data: &[u8], encoding: Encoding) -> Result<(), Status> {
        let schema = self.get_schema_entry(schema_name)?;
        schema::validate_message(&self.validators, &schema, data, encoding)
    }

    // ---- snapshots ----

    pub async fn create_snapshot_entry(&self, name: &str, subscription_name: &str) -> Result<Snapshot, Status> {
        let (_, id) = parse_resource_name(name, "snapshots")?;
        validate_resource_id(id)?;
        let state = self.subscription_state(subscription_name)?;
        if self.snapshots.read().contains_key(name) {
            return Err(Status::already_exists(format!("snapshot already exists: {name}")));
        }
        let (tx, rx) = oneshot::channel();
        state
            .tx
            .send(Command::CaptureSnapshot { reply: tx })
            .map_err(|_| Status::not_found(format!("subscription is gone: {subscription_name}")))?;
        let data = rx
            .await
            .map_err(|_| Status::not_found(format!("subscription is gone: {subscription_name}")))?;

        let info = Snapshot {
            name: name.to_string(),
            subscription: subscription_name.to_string(),
            topic: state.topic.clone(),
            expire_time: SystemTime::now() + SNAPSHOT_TTL,
        };
        let mut snapshots = self.snapshots.write();
        if snapshots.contains_key(name) {
            return Err(Status::already_exists(format!("snapshot already exists: {name}")));
        }
        snapshots.insert(name.to_string(), Arc::new(SnapshotState { info: info.clone(), data }));
        Ok(info)
    }

    /// Looks a snapshot up, enforcing expiry lazily: an expired snapshot is
    /// dropped and reported as missing.
    fn snapshot_state(&self, name: &str) -> Result<Arc<SnapshotState>, Status> {
        parse_resource_name(name, "snapshots")?;
        let missing = || Status::not_found(format!("snapshot not found: {name}"));
        let state = self.snapshots.read().get(name).cloned().ok_or_else(missing)?;
        if state.is_expired(SystemTime::now()) {
            self.snapshots.write().remove(name);
            return Err(missing());
        }
        Ok(state)
    }

    pub fn get_snapshot_entry(&self, name: &str) -> Result<Snapshot, Status> {
        Ok(self.snapshot_state(name)?.info.clone())
    }

    pub fn snapshot_data(&self, name: &str) -> Result<SnapshotData, Status> {
        Ok(self.snapshot_state(name)?.data.clone())
    }

    pub fn delete_snapshot_entry(&self, name: &str) -> Result<(), Status> {
        parse_resource_name(name, "snapshots")?;
        self.snapshots
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Status::not_found(format!("snapshot not found: {name}")))
    }

    pub fn list_snapshots(&self, project: &str, options: ListOptions) -> ListPage<Snapshot> {
        let now = SystemTime::now();
        let prefix = format!("projects/{project}/snapshots/");
        let snapshots: Vec<Snapshot> = self
            .snapshots
            .read()
            .values()
            .filter(|s| s.info.name.starts_with(&prefix) && !s.is_expired(now))
            .map(|s| s.info.clone())
            .collect();
        paginate(snapshots, |s| s.name.as_str(), options)
    }
}

fn paginate<T>(items: Vec<T>, key: impl Fn(&T) -> &str, options: ListOptions) -> ListPage<T> {
    let start = match &options.page_token {
        None => 0,
        Some(token) => items
            .iter()
            .position(|i| key(i) > token.as_str())
            .unwrap_or(items.len()),
    };
    let len = items.len();
    let end = if options.page_size <= 0 {
        len
    } else {
        (start + options.page_size as usize).min(len)
    };
    let mut items = items;
    let page: Vec<T> = items.drain(start..end).collect();
    let next_page_token = (end < len && !page.is_empty()).then(|| key(page.last().unwrap()).to_string());
    ListPage {
        items: page,
        next_page_token,
    }
}

/// Broker is an in-process Pub/Sub service scoped to a single project.
///
/// It owns every topic, subscription, schema and snapshot; handles returned
/// by [`topic`](Broker::topic) and [`subscription`](Broker::subscription)
/// are cheap references. State lives for the life of the process.
///
/// Brokers should be reused rather than being created as needed.
/// A Broker may be shared by multiple tasks.
#[derive(Clone)]
pub struct Broker {
    project_id: String,
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(project_id: &str, config: Option<BrokerConfig>) -> Self {
        Self {
            project_id: project_id.to_string(),
            inner: BrokerInner::new(config.unwrap_or_default()),
        }
    }

    /// topic creates a reference to a topic in the broker's project.
    ///
    /// If a Topic's publish method is called, it has background batching
    /// tasks associated with it. Clean them up by calling topic.close.
    pub fn topic(&self, id: &str) -> Topic {
        Topic::new(self.fully_qualified_topic_name(id), self.inner.clone(), None)
    }

    /// subscription creates a reference to a subscription.
    pub fn subscription(&self, id: &str) -> Subscription {
        Subscription::new(self.fully_qualified_subscription_name(id), self.inner.clone())
    }

    /// create_topic creates a new topic.
    ///
    /// The specified topic ID must start with a letter, and contain only
    /// letters, numbers, dashes, underscores, periods, tildes, plus or
    /// percent signs. It must be between 3 and 255 characters in length, and
    /// must not start with "goog".
    ///
    /// If the topic already exists an error will be returned.
    pub async fn create_topic(
        &self,
        id: &str,
        cfg: Option<TopicConfig>,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<Topic, Status> {
        let topic = self.topic(id);
        topic.create(cfg, cancel, retry).await.map(|_| topic)
    }

    /// create_subscription creates a new subscription on a topic.
    ///
    /// cfg.ack_deadline_seconds is the maximum time after a subscriber
    /// receives a message before the subscriber should acknowledge the
    /// message. It must be between 10 and 600 seconds (0 selects the default
    /// of 10 seconds).
    ///
    /// cfg.push_config may be set to configure this subscription for push
    /// delivery through the broker's push hook.
    ///
    /// If the subscription already exists an error will be returned.
    pub async fn create_subscription(
        &self,
        id: &str,
        topic_id: &str,
        cfg: SubscriptionConfig,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<Subscription, Status> {
        let subscription = self.subscription(id);
        subscription
            .create(self.fully_qualified_topic_name(topic_id).as_str(), cfg, cancel, retry)
            .await
            .map(|_| subscription)
    }

    /// get_topics returns the fully qualified names of the project's topics.
    pub async fn get_topics(
        &self,
        options: ListOptions,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<ListPage<String>, Status> {
        check_cancelled(&cancel)?;
        Ok(self.inner.list_topics(&self.project_id, options))
    }

    /// get_subscriptions returns handles for the project's subscriptions.
    pub async fn get_subscriptions(
        &self,
        options: ListOptions,
        cancel: Option<CancellationToken>,
        _retry: Option<RetrySetting>,
    ) -> Result<ListPage<Subscription>, Status> {
        check_cancelled(&cancel)?;
        let page = self.inner.list_subscriptions(&self.project_id, options);
        Ok(ListPage {
            items: page
                .items
                .into_iter()
                .map(|name| Subscription::new(name, self.inner.clone()))
                .collect(),
            next_page_token: page.next_page_token,
        })
    }

    // ---- schema registry ----

    pub async fn create_schema(
        &self,
        id: &str,
        schema_type: SchemaType,
        definition: impl Into<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Schema, Status> {
        check_cancelled(&cancel)?;
        self.inner
            .create_schema_entry(&self.fully_qualified_schema_name(id), schema_type, definition.into())
    }

    pub async fn get_schema(&self, id: &str, cancel: Option<CancellationToken>) -> Result<Schema, Status> {
        check_cancelled(&cancel)?;
        self.inner.get_schema_entry(&self.fully_qualified_schema_name(id))
    }

    pub async fn list_schemas(
        &self,
        options: ListOptions,
        cancel: Option<CancellationToken>,
    ) -> Result<ListPage<Schema>, Status> {
        check_cancelled(&cancel)?;
        Ok(self.inner.list_schemas(&self.project_id, options))
    }

    pub async fn delete_schema(&self, id: &str, cancel: Option<CancellationToken>) -> Result<(), Status> {
        check_cancelled(&cancel)?;
        self.inner.delete_schema_entry(&self.fully_qualified_schema_name(id))
    }

    /// validate_schema checks a definition without registering it.
    pub async fn validate_schema(
        &self,
        schema_type: SchemaType,
        definition: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<(), Status> {
        check_cancelled(&cancel)?;
        self.inner.validate_schema_definition(schema_type, definition)
    }

    /// validate_message checks a payload against a registered schema.
    /// Schema types without an installed validator fail `Unimplemented`.
    pub async fn validate_message(
        &self,
        schema_id: &str,
        data: &[u8],
        encoding: Encoding,
        cancel: Option<CancellationToken>,
    ) -> Result<(), Status> {
        check_cancelled(&cancel)?;
        self.inner
            .validate_message_entry(&self.fully_qualified_schema_name(schema_id), data, encoding)
    }

    // ---- snapshots ----

    /// create_snapshot captures the subscription's unacked state under the
    /// given snapshot id. Snapshots expire seven days after creation.
    pub async fn create_snapshot(
        &self,
        id: &str,
        subscription_id: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<Snapshot, Status> {
        check_cancelled(&cancel)?;
        self.inner
            .create_snapshot_entry(
                &self.fully_qualified_snapshot_name(id),
                &self.fully_qualified_subscription_name(subscription_id),
            )
            .await
    }

    pub async fn get_snapshot(&self, id: &str, cancel: Option<CancellationToken>) -> Result<Snapshot, Status> {
        check_cancelled(&cancel)?;
        self.inner.get_snapshot_entry(&self.fully_qualified_snapshot_name(id))
    }

    pub async fn list_snapshots(
        &self,
        options: ListOptions,
        cancel: Option<CancellationToken>,
    ) -> Result<ListPage<Snapshot>, Status> {
        check_cancelled(&cancel)?;
        Ok(self.inner.list_snapshots(&self.project_id, options))
    }

    pub async fn delete_snapshot(&self, id: &str, cancel: Option<CancellationToken>) -> Result<(), Status> {
        check_cancelled(&cancel)?;
        self.inner.delete_snapshot_entry(&self.fully_qualified_snapshot_name(id))
    }

    pub fn fully_qualified_topic_name(&self, id: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, id)
    }

    pub fn fully_qualified_subscription_name(&self, id: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, id)
    }

    pub fn fully_qualified_schema_name(&self, id: &str) -> String {
        format!("projects/{}/schemas/{}", self.project_id, id)
    }

    pub fn fully_qualified_snapshot_name(&self, id: &str) -> String {
        format!("projects/{}/snapshots/{}", self.project_id, id)
    }
}
