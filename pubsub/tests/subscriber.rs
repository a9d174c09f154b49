use std::collections::HashMap;
use std::time::Duration;

use pubsub_emulator::broker::Broker;
use pubsub_emulator::message::PubsubMessage;
use pubsub_emulator::status::Code;
use pubsub_emulator::subscriber::{AckResponse, SubscribeConfig};
use pubsub_emulator::subscription::{DeadLetterPolicy, RetryPolicy, Subscription, SubscriptionConfig};
use pubsub_emulator::topic::{Topic, TopicConfig};
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

fn create_message(data: &[u8], ordering_key: &str) -> PubsubMessage {
    PubsubMessage {
        data: data.to_vec(),
        ordering_key: ordering_key.to_string(),
        ..Default::default()
    }
}

async fn create_pair(broker: &Broker, config: SubscriptionConfig) -> (Topic, Subscription) {
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let topic = broker.create_topic(topic_id.as_str(), None, None, None).await.unwrap();
    let subscription = broker
        .create_subscription(subscription_id.as_str(), topic_id.as_str(), config, None, None)
        .await
        .unwrap();
    (topic, subscription)
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_basic_publish_pull_ack() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(
            vec![
                create_message(b"a", ""),
                create_message(b"b", ""),
                create_message(b"c", ""),
            ],
            None,
        )
        .await?;

    let messages = subscription.pull(10, None, None).await?;
    assert_eq!(messages.len(), 3);
    let mut data: Vec<Vec<u8>> = messages.iter().map(|m| m.message.data.clone()).collect();
    data.sort();
    assert_eq!(data, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    for message in &messages {
        message.ack().await?;
    }
    let messages = subscription.pull(10, None, None).await?;
    assert!(messages.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_pull_caps_at_max_messages() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(
            (0..3).map(|i| create_message(format!("m{i}").as_bytes(), "")).collect(),
            None,
        )
        .await?;
    let messages = subscription.pull(2, None, None).await?;
    assert_eq!(messages.len(), 2);
    for m in messages {
        m.ack().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_per_key_ordering() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let subscription_id = unique("s");
    let topic = broker
        .create_topic(
            topic_id.as_str(),
            Some(TopicConfig {
                enable_message_ordering: true,
                ..Default::default()
            }),
            None,
            None,
        )
        .await?;
    let subscription = broker
        .create_subscription(
            subscription_id.as_str(),
            topic_id.as_str(),
            SubscriptionConfig {
                enable_message_ordering: true,
                ..Default::default()
            },
            None,
            None,
        )
        .await?;

    let mut awaiters = Vec::new();
    for data in ["1", "2", "3"] {
        awaiters.push(topic.publish(create_message(data.as_bytes(), "u1")).await);
    }
    for data in ["A", "B"] {
        awaiters.push(topic.publish(create_message(data.as_bytes(), "u2")).await);
    }
    for awaiter in awaiters {
        awaiter.get(None).await?;
    }

    // A key's next message only becomes deliverable once the previous one is
    // acked, so drain with a pull/ack loop and record arrival order per key.
    let mut received: HashMap<String, Vec<String>> = HashMap::new();
    let mut total = 0;
    while total < 5 {
        let messages = subscription.pull(10, None, None).await?;
        for message in messages {
            let data = String::from_utf8(message.message.data.clone())?;
            received
                .entry(message.message.ordering_key.clone())
                .or_default()
                .push(data);
            message.ack().await?;
            total += 1;
        }
    }

    assert_eq!(received["u1"], vec!["1", "2", "3"]);
    assert_eq!(received["u2"], vec!["A", "B"]);
    topic.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_dead_letter_after_max_attempts() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let dlq_topic_id = unique("dlq");
    let subscription_id = unique("s");
    let dlq_subscription_id = unique("dlq-s");

    let topic = broker.create_topic(topic_id.as_str(), None, None, None).await?;
    let dlq_topic = broker.create_topic(dlq_topic_id.as_str(), None, None, None).await?;
    let dlq_subscription = broker
        .create_subscription(
            dlq_subscription_id.as_str(),
            dlq_topic_id.as_str(),
            SubscriptionConfig::default(),
            None,
            None,
        )
        .await?;
    let subscription = broker
        .create_subscription(
            subscription_id.as_str(),
            topic_id.as_str(),
            SubscriptionConfig {
                dead_letter_policy: Some(DeadLetterPolicy {
                    dead_letter_topic: dlq_topic.fully_qualified_name().to_string(),
                    max_delivery_attempts: 5,
                }),
                // No retry policy: redelivery is immediate.
                ..Default::default()
            },
            None,
            None,
        )
        .await?;

    topic
        .publish_immediately(
            vec![PubsubMessage {
                data: "poison".into(),
                attributes: HashMap::from([("k".to_string(), "v".to_string())]),
                ..Default::default()
            }],
            None,
        )
        .await?;

    for attempt in 1usize..=5 {
        let messages = subscription.pull(1, None, None).await?;
        assert_eq!(messages.len(), 1, "delivery attempt {attempt}");
        assert_eq!(messages[0].delivery_attempt(), Some(attempt));
        messages[0].nack().await?;
    }

    // The attempt budget is spent: gone from the subscription, on the DLQ.
    let messages = subscription.pull(10, None, None).await?;
    assert!(messages.is_empty());

    let messages = dlq_subscription.pull(10, None, None).await?;
    assert_eq!(messages.len(), 1);
    let forwarded = &messages[0].message;
    assert_eq!(forwarded.data, b"poison".to_vec());
    assert_eq!(forwarded.attributes["k"], "v");
    assert_eq!(
        forwarded.attributes["cloudPubSubDeadLetterSourceSubscription"],
        subscription.fully_qualified_name()
    );
    assert_eq!(forwarded.attributes["cloudPubSubDeadLetterSourceDeliveryCount"], "5");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_filter_matching() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let topic_id = unique("t");
    let topic = broker.create_topic(topic_id.as_str(), None, None, None).await?;
    let matching = broker
        .create_subscription(
            unique("s").as_str(),
            topic_id.as_str(),
            SubscriptionConfig {
                filter: r#"attributes.env = "prod""#.to_string(),
                ..Default::default()
            },
            None,
            None,
        )
        .await?;
    let complement = broker
        .create_subscription(
            unique("s").as_str(),
            topic_id.as_str(),
            SubscriptionConfig {
                filter: r#"NOT attributes.env = "prod""#.to_string(),
                ..Default::default()
            },
            None,
            None,
        )
        .await?;

    let attributes = [
        HashMap::from([("env".to_string(), "prod".to_string())]),
        HashMap::from([("env".to_string(), "dev".to_string())]),
        HashMap::from([("env".to_string(), "prod".to_string())]),
        HashMap::from([("region".to_string(), "us".to_string())]),
    ];
    for (i, attrs) in attributes.iter().enumerate() {
        topic
            .publish_immediately(
                vec![PubsubMessage {
                    data: format!("m{i}").into_bytes(),
                    attributes: attrs.clone(),
                    ..Default::default()
                }],
                None,
            )
            .await?;
    }

    let messages = matching.pull(10, None, None).await?;
    let mut data: Vec<String> = messages
        .iter()
        .map(|m| String::from_utf8(m.message.data.clone()).unwrap())
        .collect();
    data.sort();
    assert_eq!(data, vec!["m0", "m2"]);

    let messages = complement.pull(10, None, None).await?;
    let mut data: Vec<String> = messages
        .iter()
        .map(|m| String::from_utf8(m.message.data.clone()).unwrap())
        .collect();
    data.sort();
    assert_eq!(data, vec!["m1", "m3"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_exactly_once_no_redelivery_after_success() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(
        &broker,
        SubscriptionConfig {
            enable_exactly_once_delivery: true,
            ..Default::default()
        },
    )
    .await;

    topic
        .publish_immediately(vec![create_message(b"once", "")], None)
        .await?;

    let stream = subscription.subscribe(None).await?;
    let message = stream.recv().await?;
    assert_eq!(message.ack_with_response().await?, AckResponse::Success);

    // Settling again is observable as Invalid, never a redelivery.
    assert_eq!(message.ack_with_response().await?, AckResponse::Invalid);
    assert_eq!(message.nack_with_response().await?, AckResponse::Invalid);
    assert_eq!(message.modify_ack_deadline_with_response(30).await?, AckResponse::Invalid);
    stream.dispose().await;

    let stream = subscription.subscribe(None).await?;
    let redelivery = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await;
    assert!(redelivery.is_err(), "acked message must not be redelivered");
    stream.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_nack_redelivers() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"retry-me", "")], None)
        .await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    let first_ack_id = messages[0].ack_id().to_string();
    messages[0].nack().await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.data, b"retry-me".to_vec());
    assert_ne!(messages[0].ack_id(), first_ack_id);
    messages[0].ack().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_retry_policy_delays_redelivery() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(
        &broker,
        SubscriptionConfig {
            retry_policy: Some(RetryPolicy {
                minimum_backoff: Some(Duration::from_secs(1)),
                maximum_backoff: Some(Duration::from_secs(1)),
            }),
            ..Default::default()
        },
    )
    .await;

    topic
        .publish_immediately(vec![create_message(b"backoff", "")], None)
        .await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    messages[0].nack().await?;

    // Held for the backoff window.
    let messages = subscription.pull(1, None, None).await?;
    assert!(messages.is_empty());

    tokio::time::sleep(Duration::from_millis(1300)).await;
    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    messages[0].ack().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_lease_expiry_redelivers() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"expiring", "")], None)
        .await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    // Never settled: the 10 second lease runs out.
    drop(messages);

    tokio::time::sleep(Duration::from_secs(11)).await;
    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.data, b"expiring".to_vec());
    messages[0].ack().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_modack_extends_lease() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"extended", "")], None)
        .await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    messages[0].modify_ack_deadline(60).await?;

    // Past the original 10 second deadline the lease still stands.
    tokio::time::sleep(Duration::from_secs(11)).await;
    let redelivered = subscription.pull(1, None, None).await?;
    assert!(redelivered.is_empty());
    messages[0].ack().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_modack_zero_is_nack() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"released", "")], None)
        .await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    messages[0].modify_ack_deadline(0).await?;

    let messages = subscription.pull(1, None, None).await?;
    assert_eq!(messages.len(), 1);
    messages[0].ack().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_streaming_flow_control() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"one", ""), create_message(b"two", "")], None)
        .await?;

    let stream = subscription
        .subscribe(Some(SubscribeConfig {
            max_outstanding_messages: 1,
            ..Default::default()
        }))
        .await?;

    let first = stream.recv().await?;
    // The outstanding budget is spent until the first message settles.
    let blocked = tokio::time::timeout(Duration::from_millis(400), stream.recv()).await;
    assert!(blocked.is_err());

    first.ack().await?;
    let second = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await??;
    second.ack().await?;
    stream.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_stream_teardown_requeues_outstanding() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"orphaned", "")], None)
        .await?;

    let stream = subscription.subscribe(None).await?;
    let message = stream.recv().await?;
    assert_eq!(message.message.data, b"orphaned".to_vec());
    // Session dies with the message outstanding: treated as a nack.
    drop(stream);

    let stream = subscription.subscribe(None).await?;
    let redelivered = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await??;
    assert_eq!(redelivered.message.data, b"orphaned".to_vec());
    redelivered.ack().await?;
    stream.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_message_stream_is_a_stream() -> Result<(), anyhow::Error> {
    use futures_util::StreamExt;

    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    topic
        .publish_immediately(vec![create_message(b"s1", ""), create_message(b"s2", "")], None)
        .await?;

    let mut stream = subscription.subscribe(None).await?;
    let first = stream.next().await.expect("stream open");
    let second = stream.next().await.expect("stream open");
    first.ack().await?;
    second.ack().await?;
    stream.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_receive_with_callback() -> Result<(), anyhow::Error> {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    let broker = create_broker();
    let (topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    let cancellation_token = CancellationToken::new();
    let cancel_receiver = cancellation_token.clone();
    let v = Arc::new(AtomicU32::new(0));
    let v2 = v.clone();
    let handle = tokio::spawn(async move {
        let _ = subscription
            .receive(
                move |message, _ctx| {
                    let v2 = v2.clone();
                    async move {
                        v2.fetch_add(1, SeqCst);
                        let _ = message.ack().await;
                    }
                },
                cancel_receiver,
                None,
            )
            .await;
    });

    topic
        .publish_immediately(vec![create_message(b"callback", "")], None)
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancellation_token.cancel();
    let _ = handle.await;
    assert_eq!(v.load(SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_pull_returns_quickly_when_idle() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let (_topic, subscription) = create_pair(&broker, SubscriptionConfig::default()).await;

    let start = std::time::Instant::now();
    let messages = subscription.pull(1, None, None).await?;
    assert!(messages.is_empty());
    assert!(start.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_pull_missing_subscription() -> Result<(), anyhow::Error> {
    let broker = create_broker();
    let subscription = broker.subscription(&unique("s"));
    let err = subscription.pull(1, None, None).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    Ok(())
}
