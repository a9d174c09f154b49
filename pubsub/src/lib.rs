//! # pubsub-emulator
//!
//! An in-process, API-compatible Google Cloud Pub/Sub broker for local
//! development and testing.
//!
//! * [About Cloud Pub/Sub](https://cloud.google.com/pubsub/)
//! * [Pub/Sub API Documentation](https://cloud.google.com/pubsub/docs)
//!
//! Producers publish immutable messages to named topics; consumers read them
//! through subscriptions with leases, at-least-once redelivery, per-key
//! ordering, retry backoff and dead-letter forwarding — the observable
//! semantics of the production service, held entirely in memory for the life
//! of the process.
//!
//! ## Quick Start
//!
//! ### Publish Message
//!
//! ```
//! use pubsub_emulator::broker::Broker;
//! use pubsub_emulator::message::PubsubMessage;
//! use pubsub_emulator::status::Status;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Status> {
//!
//!     // Create the in-process broker.
//!     let broker = Broker::new("local-project", None);
//!
//!     // Create topic.
//!     let topic = broker.create_topic("test-topic", None, None, None).await?;
//!
//!     // Publish message. The awaiter resolves to the server-assigned id.
//!     let tasks = (0..10).map(|_i| {
//!         let topic = broker.topic("test-topic");
//!         tokio::spawn(async move {
//!             let awaiter = topic.publish(PubsubMessage {
//!                 data: "abc".into(),
//!                 ..Default::default()
//!             }).await;
//!             awaiter.get(None).await
//!         })
//!     });
//!
//!     // Wait for all publish tasks to finish.
//!     for task in tasks {
//!         let message_id = task.await.unwrap()?;
//!         println!("published {message_id}");
//!     }
//!
//!     // Wait for the batching workers in the topic to finish.
//!     topic.flush().await;
//!     topic.close();
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Subscribe Message
//!
//! ```
//! use pubsub_emulator::broker::Broker;
//! use pubsub_emulator::status::Status;
//! use pubsub_emulator::subscription::SubscriptionConfig;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Status> {
//!
//!     let broker = Broker::new("local-project", None);
//!     let topic = broker.create_topic("test-topic", None, None, None).await?;
//!
//!     // Configure subscription.
//!     let mut config = SubscriptionConfig::default();
//!     // Enable message ordering if needed (https://cloud.google.com/pubsub/docs/ordering)
//!     config.enable_message_ordering = true;
//!
//!     // Create subscription.
//!     let subscription = broker
//!         .create_subscription("test-subscription", "test-topic", config, None, None)
//!         .await?;
//!
//!     // Token for cancel.
//!     let cancel = CancellationToken::new();
//!     let cancel2 = cancel.clone();
//!     tokio::spawn(async move {
//!         // Cancel after 10 seconds.
//!         tokio::time::sleep(Duration::from_secs(10)).await;
//!         cancel2.cancel();
//!     });
//!
//!     // Receive blocks until the cancellation token is cancelled.
//!     subscription.receive(|message, _cancel| async move {
//!         println!("{:?}", message.message.data.as_slice());
//!         let _ = message.ack().await;
//!     }, cancel, None).await?;
//!
//!     // Delete subscription if needed.
//!     subscription.delete(None, None).await?;
//!
//!     Ok(())
//! }
//! ```
pub mod broker;
mod dispatcher;
mod filter;
pub mod flow;
pub mod message;
pub mod publisher;
mod queue;
pub mod schema;
pub mod snapshot;
pub mod status;
pub mod subscriber;
pub mod subscription;
pub mod topic;
mod tracker;
mod util;
