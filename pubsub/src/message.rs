use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use prost_types::Timestamp;

use crate::status::Status;
use crate::util::to_timestamp;

/// Maximum size of a message, data and attributes included.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
/// Maximum byte length of an attribute key.
pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 256;
/// Maximum byte length of an attribute value.
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 1024;

/// Attributes stamped on a message when the broker forwards it to a
/// dead letter topic.
pub const DEAD_LETTER_SOURCE_SUBSCRIPTION_ATTRIBUTE: &str = "cloudPubSubDeadLetterSourceSubscription";
pub const DEAD_LETTER_DELIVERY_COUNT_ATTRIBUTE: &str = "cloudPubSubDeadLetterSourceDeliveryCount";

/// A message to be published or received.
///
/// The field layout matches the `google.pubsub.v1.PubsubMessage` wire type;
/// `message_id` and `publish_time` are assigned by the broker on admission
/// and any caller supplied values are discarded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PubsubMessage {
    /// The message body. May be empty when at least one attribute is set.
    pub data: Vec<u8>,
    /// Attributes for this message. Keys must not start with `goog`.
    pub attributes: HashMap<String, String>,
    /// Server assigned id, unique within the broker lifetime.
    pub message_id: String,
    /// Wall clock time at which the broker admitted the message.
    pub publish_time: Option<Timestamp>,
    /// If non-empty, messages with the same key on the same topic are
    /// delivered in publish order.
    pub ordering_key: String,
}

impl PubsubMessage {
    /// Byte size as counted against message and flow-control limits.
    pub(crate) fn size(&self) -> usize {
        self.data.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self.ordering_key.len()
    }

    /// Admission checks applied synchronously to every publish call.
    pub(crate) fn validate_for_publish(&self) -> Result<(), Status> {
        if self.data.is_empty() && self.attributes.is_empty() {
            return Err(Status::invalid_argument("message must have data or attributes"));
        }
        for (key, value) in &self.attributes {
            if key.is_empty() {
                return Err(Status::invalid_argument("attribute key must not be empty"));
            }
            if key.starts_with("goog") {
                return Err(Status::invalid_argument(format!(
                    "attribute keys starting with 'goog' are reserved: {key}"
                )));
            }
            if key.len() > MAX_ATTRIBUTE_KEY_BYTES {
                return Err(Status::invalid_argument(format!(
                    "attribute key exceeds {MAX_ATTRIBUTE_KEY_BYTES} bytes: {key}"
                )));
            }
            if value.len() > MAX_ATTRIBUTE_VALUE_BYTES {
                return Err(Status::invalid_argument(format!(
                    "attribute value for '{key}' exceeds {MAX_ATTRIBUTE_VALUE_BYTES} bytes"
                )));
            }
        }
        if self.size() > MAX_MESSAGE_SIZE {
            return Err(Status::invalid_argument(format!(
                "message size {} exceeds the {MAX_MESSAGE_SIZE} byte limit",
                self.size()
            )));
        }
        Ok(())
    }
}

/// An admitted message as held by the broker.
///
/// Immutable once built; subscriptions reference it through `Arc` so a
/// fan-out to many subscriptions never copies the payload.
#[derive(Debug)]
pub(crate) struct StoredMessage {
    pub message: PubsubMessage,
    /// Wall clock admission stamp, also present on `message.publish_time`.
    pub published_at: SystemTime,
    /// Monotonic admission stamp driving retention.
    pub admitted_at: Instant,
    pub size: usize,
}

impl StoredMessage {
    pub fn new(mut message: PubsubMessage, id: u64, published_at: SystemTime) -> Self {
        message.message_id = id.to_string();
        message.publish_time = Some(to_timestamp(published_at));
        let size = message.size();
        Self {
            message,
            published_at,
            admitted_at: Instant::now(),
            size,
        }
    }
}
