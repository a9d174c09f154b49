use std::collections::HashMap;
use std::time::Duration;

use pubsub_emulator::broker::Broker;
use pubsub_emulator::flow::{FlowControlSettings, LimitExceededBehavior};
use pubsub_emulator::message::PubsubMessage;
use pubsub_emulator::publisher::PublisherConfig;
use pubsub_emulator::status::Code;
use pubsub_emulator::subscription::SubscriptionConfig;
use serial_test::serial;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt().try_init();
}

fn create_broker() -> Broker {
    Broker::new("local-project", None)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4())
}

fn create_message(data: &[u8], ordering_key: &str) -> PubsubMessage {
    PubsubMessage {
        data: data.to_vec(),
        ordering_key: ordering_key.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_publish() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic = broker.create_topic(unique("t").as_str(), None, None, None).await?;

    let awaiter = topic.publish(create_message(b"abc", "")).await;
    let message_id = awaiter.get(None).await?;
    assert!(message_id.parse::<u64>()? > 0);
    topic.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_publish_admission_bounds() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic = broker.create_topic(unique("t").as_str(), None, None, None).await?;

    // Empty messages are rejected.
    let err = topic.publish(PubsubMessage::default()).await.get(None).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Attribute key bounds: 256 accepted, 257 rejected.
    let mut message = create_message(b"abc", "");
    message.attributes = HashMap::from([("k".repeat(256), "v".to_string())]);
    topic.publish(message).await.get(None).await?;

    let mut message = create_message(b"abc", "");
    message.attributes = HashMap::from([("k".repeat(257), "v".to_string())]);
    let err = topic.publish(message).await.get(None).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Attribute value bounds: 1024 accepted, 1025 rejected.
    let mut message = create_message(b"abc", "");
    message.attributes = HashMap::from([("k".to_string(), "v".repeat(1024))]);
    topic.publish(message).await.get(None).await?;

    let mut message = create_message(b"abc", "");
    message.attributes = HashMap::from([("k".to_string(), "v".repeat(1025))]);
    let err = topic.publish(message).await.get(None).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // goog-prefixed attribute keys are reserved.
    let mut message = create_message(b"abc", "");
    message.attributes = HashMap::from([("googclient_version".to_string(), "1".to_string())]);
    let err = topic.publish(message).await.get(None).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    topic.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_message_size_bound() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic = broker.create_topic(unique("t").as_str(), None, None, None).await?;

    let ids = topic
        .publish_immediately(vec![create_message(&vec![0u8; 10 * 1024 * 1024], "")], None)
        .await?;
    assert_eq!(ids.len(), 1);

    let err = topic
        .publish_immediately(vec![create_message(&vec![0u8; 10 * 1024 * 1024 + 1], "")], None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_ordering_key_requires_ordering_publisher() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic = broker.create_topic(unique("t").as_str(), None, None, None).await?;

    let publisher = topic.new_publisher(None);
    let err = publisher
        .publish(create_message(b"abc", "key"))
        .await
        .get(None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_failed_key_pauses_until_resumed() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    // No topic yet: the first keyed publish fails and pauses the key.
    let topic = broker.topic(topic_id.as_str());
    let publisher = topic.new_publisher(Some(PublisherConfig {
        enable_message_ordering: true,
        ..Default::default()
    }));

    let err = publisher
        .publish(create_message(b"1", "k1"))
        .await
        .get(None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    broker.create_topic(topic_id.as_str(), None, None, None).await?;

    // Still paused, and still failing with the original error.
    let err = publisher
        .publish(create_message(b"2", "k1"))
        .await
        .get(None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // Other keys proceed independently.
    publisher.publish(create_message(b"3", "k2")).await.get(None).await?;

    publisher.resume_publishing("k1");
    publisher.publish(create_message(b"4", "k1")).await.get(None).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_flow_control_error_behavior() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic = broker.create_topic(unique("t").as_str(), None, None, None).await?;

    // A huge flush interval keeps the first message buffered, holding its
    // flow-control slot.
    let publisher = topic.new_publisher(Some(PublisherConfig {
        flush_interval: Duration::from_secs(30),
        flow_control: Some(FlowControlSettings {
            max_outstanding_messages: 1,
            max_outstanding_bytes: 1 << 20,
            limit_exceeded_behavior: LimitExceededBehavior::Error,
        }),
        ..Default::default()
    }));

    let first = publisher.publish(create_message(b"first", "")).await;
    let err = publisher
        .publish(create_message(b"second", ""))
        .await
        .get(None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);

    // Flushing releases the slot.
    publisher.flush().await;
    first.get(None).await?;
    let third = publisher.publish(create_message(b"third", "")).await;
    publisher.flush().await;
    third.get(None).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_flush_fans_out_before_returning() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let topic = broker.create_topic(topic_id.as_str(), None, None, None).await?;
    let subscription = broker
        .create_subscription(
            subscription_id.as_str(),
            topic_id.as_str(),
            SubscriptionConfig::default(),
            None,
            None,
        )
        .await?;

    let mut awaiters = Vec::with_capacity(10);
    for i in 0..10 {
        awaiters.push(topic.publish(create_message(format!("abc_{i}").as_bytes(), "")).await);
    }
    topic.flush().await;

    // Everything published before the flush is already deliverable.
    let messages = subscription.pull(10, None, None).await?;
    assert_eq!(messages.len(), 10);

    for awaiter in awaiters {
        awaiter.get(None).await?;
    }
    topic.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_publish_order_is_total() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic = broker.create_topic(unique("t").as_str(), None, None, None).await?;

    let first = topic.publish_immediately(vec![create_message(b"m1", "")], None).await?;
    let second = topic.publish_immediately(vec![create_message(b"m2", "")], None).await?;
    assert!(first[0].parse::<u64>()? < second[0].parse::<u64>()?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_publish_cancel() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let topic = broker.create_topic(topic_id.as_str(), None, None, None).await?;
    let subscription = broker
        .create_subscription(
            subscription_id.as_str(),
            topic_id.as_str(),
            SubscriptionConfig::default(),
            None,
            None,
        )
        .await?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let awaiter = topic.publish(create_message(b"racy", "")).await;
    let err = awaiter.get(Some(cancel)).await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);

    // The publish was already admitted to the pipeline: cancellation does
    // not roll it back and the message may still be delivered.
    topic.flush().await;
    let messages = subscription.pull(10, None, None).await?;
    assert_eq!(messages.len(), 1);
    topic.close();
    Ok(())
}
