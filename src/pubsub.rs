//! Out-of-band signalling between the build host and its consumers.
//!
//! The build host publishes a readiness message once its workload is up;
//! after teardown the pipeline publishes an update message downstream.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::backend::BackendFuture;

/// Errors raised by the pub/sub collaborator.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PubSubError {
    /// Raised when the broker cannot be reached.
    #[error("failed to connect to message broker: {0}")]
    Connect(String),
    /// Raised when a subscription cannot be established.
    #[error("failed to subscribe to {topic}: {message}")]
    Subscribe {
        /// Topic requested.
        topic: String,
        /// Broker error description.
        message: String,
    },
    /// Raised when a message cannot be received or decoded.
    #[error("failed to receive from {topic}: {message}")]
    Receive {
        /// Subscribed topic.
        topic: String,
        /// Broker error description.
        message: String,
    },
    /// Raised when publishing fails.
    #[error("failed to publish to {topic}: {message}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Broker error description.
        message: String,
    },
}

/// An open subscription to one topic.
pub trait Subscription: Send + 'static {
    /// Waits up to `wait` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn next_message(&mut self, wait: Duration) -> BackendFuture<'_, Option<String>, PubSubError>;
}

/// Publish/subscribe broker.
pub trait PubSub: Send + Sync {
    /// Subscription handle produced by [`PubSub::subscribe`].
    type Subscription: Subscription;

    /// Subscribes to `topic`.
    fn subscribe<'a>(&'a self, topic: &'a str)
    -> BackendFuture<'a, Self::Subscription, PubSubError>;

    /// Publishes `payload` on `topic`.
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a str) -> BackendFuture<'a, (), PubSubError>;
}

/// Broker backed by Redis pub/sub.
#[derive(Clone, Debug)]
pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    /// Creates a broker handle for `url`. No connection is made until the
    /// first subscribe or publish.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Connect`] when the URL is malformed.
    pub fn new(url: &str) -> Result<Self, PubSubError> {
        let client =
            redis::Client::open(url).map_err(|err| PubSubError::Connect(err.to_string()))?;
        Ok(Self { client })
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = redis::Msg> + Send>>;

/// Subscription over a dedicated Redis pub/sub connection.
pub struct RedisSubscription {
    topic: String,
    messages: MessageStream,
}

impl std::fmt::Debug for RedisSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Subscription for RedisSubscription {
    fn next_message(&mut self, wait: Duration) -> BackendFuture<'_, Option<String>, PubSubError> {
        Box::pin(async move {
            let Ok(next) = timeout(wait, self.messages.next()).await else {
                return Ok(None);
            };
            let message = next.ok_or_else(|| PubSubError::Receive {
                topic: self.topic.clone(),
                message: String::from("subscription closed"),
            })?;
            let payload: String = message.get_payload().map_err(|err| PubSubError::Receive {
                topic: self.topic.clone(),
                message: err.to_string(),
            })?;
            debug!(topic = %self.topic, "message received");
            Ok(Some(payload))
        })
    }
}

impl PubSub for RedisPubSub {
    type Subscription = RedisSubscription;

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
    ) -> BackendFuture<'a, Self::Subscription, PubSubError> {
        Box::pin(async move {
            let subscribe_error = |err: redis::RedisError| PubSubError::Subscribe {
                topic: topic.to_owned(),
                message: err.to_string(),
            };
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|err| PubSubError::Connect(err.to_string()))?;
            pubsub.subscribe(topic).await.map_err(subscribe_error)?;
            Ok(RedisSubscription {
                topic: topic.to_owned(),
                messages: Box::pin(pubsub.into_on_message()),
            })
        })
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: &'a str) -> BackendFuture<'a, (), PubSubError> {
        Box::pin(async move {
            let mut connection = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|err| PubSubError::Connect(err.to_string()))?;
            let receivers: i64 =
                connection
                    .publish(topic, payload)
                    .await
                    .map_err(|err| PubSubError::Publish {
                        topic: topic.to_owned(),
                        message: err.to_string(),
                    })?;
            debug!(topic, receivers, "message published");
            Ok(())
        })
    }
}
