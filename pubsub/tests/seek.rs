use std::time::{Duration, SystemTime};

use pubsub_emulator::broker::Broker;
use pubsub_emulator::message::PubsubMessage;
use pubsub_emulator::status::Code;
use pubsub_emulator::subscriber::AckResponse;
use pubsub_emulator::subscription::{SeekTarget, SubscriptionConfig};
use serial_test::serial;
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

fn create_message(data: &[u8]) -> PubsubMessage {
    PubsubMessage {
        data: data.to_vec(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_seek_to_time_boundary() -> Result<(), anyhow::Error> {
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

    topic.publish_immediately(vec![create_message(b"m1")], None).await?;
    let messages = subscription.pull(1, None, None).await?;
    messages[0].ack().await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cutoff = SystemTime::now();
    tokio::time::sleep(Duration::from_millis(50)).await;

    topic.publish_immediately(vec![create_message(b"m2")], None).await?;
    let messages = subscription.pull(1, None, None).await?;
    messages[0].ack().await?;

    subscription.seek(SeekTarget::Time(cutoff), None, None).await?;

    // Only the message published at or after the cutoff comes back.
    let messages = subscription.pull(10, None, None).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.data, b"m2".to_vec());
    messages[0].ack().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_seek_to_time_with_outstanding_leases_fails() -> Result<(), anyhow::Error> {
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

    topic.publish_immediately(vec![create_message(b"held")], None).await?;
    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);

    let err = subscription
        .seek(SeekTarget::Time(SystemTime::now()), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // Releasing the lease clears the precondition.
    messages[0].nack().await?;
    subscription.seek(SeekTarget::Time(SystemTime::now()), None, None).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_seek_to_snapshot_restores_deliverable_state() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let snapshot_id = unique("snap");
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

    topic
        .publish_immediately(
            vec![create_message(b"s1"), create_message(b"s2"), create_message(b"s3")],
            None,
        )
        .await?;

    let snapshot = broker
        .create_snapshot(snapshot_id.as_str(), subscription_id.as_str(), None)
        .await?;
    assert_eq!(snapshot.subscription, subscription.fully_qualified_name());

    // Drain and ack everything, then rewind.
    let messages = subscription.pull(10, None, None).await?;
    assert_eq!(messages.len(), 3);
    let mut expected: Vec<Vec<u8>> = messages.iter().map(|m| m.message.data.clone()).collect();
    expected.sort();
    for message in &messages {
        message.ack().await?;
    }
    assert!(subscription.pull(10, None, None).await?.is_empty());

    subscription
        .seek(SeekTarget::Snapshot(snapshot.name.clone()), None, None)
        .await?;

    let messages = subscription.pull(10, None, None).await?;
    let mut restored: Vec<Vec<u8>> = messages.iter().map(|m| m.message.data.clone()).collect();
    restored.sort();
    assert_eq!(restored, expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_seek_to_snapshot_invalidates_leases() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let snapshot_id = unique("snap");
    let topic = broker.create_topic(topic_id.as_str(), None, None, None).await?;
    let subscription = broker
        .create_subscription(
            subscription_id.as_str(),
            topic_id.as_str(),
            SubscriptionConfig {
                enable_exactly_once_delivery: true,
                ..Default::default()
            },
            None,
            None,
        )
        .await?;

    topic.publish_immediately(vec![create_message(b"leased")], None).await?;
    broker
        .create_snapshot(snapshot_id.as_str(), subscription_id.as_str(), None)
        .await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);

    subscription
        .seek(
            SeekTarget::Snapshot(broker.fully_qualified_snapshot_name(snapshot_id.as_str())),
            None,
            None,
        )
        .await?;

    // The outstanding lease died with the seek.
    assert_eq!(messages[0].ack_with_response().await?, AckResponse::Invalid);

    // The snapshot's captured message is deliverable again.
    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.data, b"leased".to_vec());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_snapshot_lifecycle() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let snapshot_id = unique("snap");
    broker.create_topic(topic_id.as_str(), None, None, None).await?;
    broker
        .create_subscription(
            subscription_id.as_str(),
            topic_id.as_str(),
            SubscriptionConfig::default(),
            None,
            None,
        )
        .await?;

    let snapshot = broker
        .create_snapshot(snapshot_id.as_str(), subscription_id.as_str(), None)
        .await?;
    assert!(snapshot.expire_time > SystemTime::now());

    let err = broker
        .create_snapshot(snapshot_id.as_str(), subscription_id.as_str(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    let fetched = broker.get_snapshot(snapshot_id.as_str(), None).await?;
    assert_eq!(fetched.name, snapshot.name);

    let page = broker.list_snapshots(Default::default(), None).await?;
    assert!(page.items.iter().any(|s| s.name == snapshot.name));

    broker.delete_snapshot(snapshot_id.as_str(), None).await?;
    let err = broker.get_snapshot(snapshot_id.as_str(), None).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    Ok(())
}
