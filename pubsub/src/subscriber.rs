use std::ops::{Deref, DerefMut};

use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::{Command, SettleAction};
use crate::message::PubsubMessage;
use crate::status::Status;

/// Outcome of an ack, nack or modack in exactly-once delivery mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckResponse {
    /// The message is settled and will not be redelivered.
    Success,
    /// The ack-id is unknown: already settled or its lease expired.
    Invalid,
    FailedPrecondition,
    PermissionDenied,
    Other,
}

/// Flow control and lease settings for one streaming-pull session.
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    /// Lease deadline for messages delivered on this stream. Must be within
    /// 10 to 600 seconds when set; defaults to the subscription's deadline.
    pub stream_ack_deadline_seconds: Option<i32>,
    /// The broker stops sending once this many delivered messages are
    /// neither acked nor nacked. `<= 0` means no limit.
    pub max_outstanding_messages: i64,
    pub max_outstanding_bytes: i64,
    /// Allow one oversized message through when the byte budget is empty.
    pub allow_excess_messages: bool,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            stream_ack_deadline_seconds: None,
            max_outstanding_messages: 50,
            max_outstanding_bytes: 1000 * 1000 * 1000,
            allow_excess_messages: false,
        }
    }
}

/// A message delivered to a consumer, with its settlement handles.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: PubsubMessage,
    ack_id: String,
    subscription: String,
    tx: mpsc::UnboundedSender<Command>,
    delivery_attempt: Option<usize>,
}

impl ReceivedMessage {
    pub(crate) fn new(
        subscription: String,
        tx: mpsc::UnboundedSender<Command>,
        message: PubsubMessage,
        ack_id: String,
        delivery_attempt: Option<usize>,
    ) -> Self {
        Self {
            message,
            ack_id,
            subscription,
            tx,
            delivery_attempt,
        }
    }

    pub fn ack_id(&self) -> &str {
        self.ack_id.as_str()
    }

    pub fn subscription(&self) -> &str {
        self.subscription.as_str()
    }

    /// The number of times the broker has delivered this message on the
    /// subscription. Only populated when a dead-letter policy is set; when
    /// present it is greater than zero.
    pub fn delivery_attempt(&self) -> Option<usize> {
        self.delivery_attempt
    }

    pub async fn ack(&self) -> Result<(), Status> {
        self.settle(SettleAction::Ack, None)
    }

    pub async fn nack(&self) -> Result<(), Status> {
        self.settle(SettleAction::Nack, None)
    }

    /// Extends (or with `0`, gives up) the lease on this message.
    pub async fn modify_ack_deadline(&self, ack_deadline_seconds: i32) -> Result<(), Status> {
        validate_extension_seconds(ack_deadline_seconds)?;
        self.settle(SettleAction::Extend(ack_deadline_seconds), None)
    }

    /// Like [`ack`](Self::ack), but reports the settlement outcome. Intended
    /// for subscriptions with exactly-once delivery enabled.
    pub async fn ack_with_response(&self) -> Result<AckResponse, Status> {
        self.settle_with_response(SettleAction::Ack).await
    }

    pub async fn nack_with_response(&self) -> Result<AckResponse, Status> {
        self.settle_with_response(SettleAction::Nack).await
    }

    pub async fn modify_ack_deadline_with_response(&self, ack_deadline_seconds: i32) -> Result<AckResponse, Status> {
        validate_extension_seconds(ack_deadline_seconds)?;
        self.settle_with_response(SettleAction::Extend(ack_deadline_seconds)).await
    }

    fn settle(&self, action: SettleAction, reply: Option<oneshot::Sender<Vec<AckResponse>>>) -> Result<(), Status> {
        self.tx
            .send(Command::Settle {
                ack_ids: vec![self.ack_id.clone()],
                action,
                reply,
            })
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.subscription)))
    }

    async fn settle_with_response(&self, action: SettleAction) -> Result<AckResponse, Status> {
        let (tx, rx) = oneshot::channel();
        self.settle(action, Some(tx))?;
        let responses = rx
            .await
            .map_err(|_| Status::not_found(format!("subscription is gone: {}", self.subscription)))?;
        Ok(responses.into_iter().next().unwrap_or(AckResponse::Other))
    }
}

pub(crate) fn validate_extension_seconds(seconds: i32) -> Result<(), Status> {
    if !(0..=600).contains(&seconds) {
        return Err(Status::invalid_argument(format!(
            "ack deadline must be between 0 and 600 seconds: {seconds}"
        )));
    }
    Ok(())
}

/// A streaming-pull session.
///
/// Messages arrive as the broker dispatches them under the session's flow
/// control budget. Dropping the stream (or calling [`dispose`]) tears the
/// session down; the broker treats still-outstanding leases as nacked, or
/// lets them expire naturally when the subscription uses exactly-once
/// delivery.
///
/// [`dispose`]: MessageStream::dispose
pub struct MessageStream {
    receiver: Option<async_channel::Receiver<ReceivedMessage>>,
}

impl Deref for MessageStream {
    type Target = async_channel::Receiver<ReceivedMessage>;

    fn deref(&self) -> &Self::Target {
        self.receiver.as_ref().unwrap()
    }
}

impl DerefMut for MessageStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.receiver.as_mut().unwrap()
    }
}

impl MessageStream {
    pub(crate) fn new(receiver: async_channel::Receiver<ReceivedMessage>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// Closes the session and nacks messages it had buffered but the caller
    /// never received. Returns how many messages were nacked.
    pub async fn dispose(mut self) -> usize {
        let receiver = match self.receiver.take() {
            None => return 0,
            Some(rx) => rx,
        };
        receiver.close();
        let mut count: usize = 0;
        while let Ok(msg) = receiver.try_recv() {
            match msg.nack().await {
                Ok(_) => count += 1,
                Err(e) => tracing::error!("nack message error: {}, {:?}", msg.ack_id(), e),
            }
        }
        count
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        let receiver = match self.receiver.take() {
            None => return,
            Some(rx) => rx,
        };
        receiver.close();
        if receiver.is_empty() {
            return;
        }
        tracing::warn!("call 'dispose' before drop in order to nack the remaining messages");
        let _forget = tokio::spawn(async move {
            while let Ok(msg) = receiver.try_recv() {
                if let Err(err) = msg.nack().await {
                    tracing::error!("failed to nack message: {:?}", err);
                }
            }
        });
    }
}
