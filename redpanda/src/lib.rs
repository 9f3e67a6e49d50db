//! Redpanda broker for outbox delivery.
//!
//! [`RedpandaBroker`] implements [`EventProducer`] on an idempotent rdkafka
//! producer and hands out one [`RedpandaConsumer`] subscription, which
//! implements [`MessageSource`] with manual offset commits. Works with any
//! Kafka-compatible cluster.
//!
//! # Delivery Semantics
//!
//! - **Producer**: idempotent, `acks=all`, one in-flight request per
//!   connection. A publish resolves only once every in-sync replica has the
//!   message, and librdkafka's own resends cannot reorder or duplicate it.
//! - **Consumer**: auto commit is off. The consumer runtime commits
//!   `offset + 1` after a message reached its terminal outcome, so a crash
//!   redelivers everything past the last commit.
//! - **Ordering**: messages are keyed by aggregate id (relay) or original
//!   offset (dead letters), and a key always maps to the same partition.
//!
//! # Example
//!
//! ```no_run
//! use outbox_redpanda::RedpandaBroker;
//! use outbox_core::broker::EventProducer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .client_id("order-service")
//!     .build()?;
//!
//! let payload = serde_json::json!({ "eventId": "e-1", "eventType": "OrderCreatedEvent" });
//! broker.publish("order.created", &payload, Some("order-1")).await?;
//!
//! let mut source = broker.subscribe("payment.processed", "order-payment-processed")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use outbox_core::broker::{
    BrokerError, EventProducer, InboundMessage, MessageSource, message_headers,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Kafka-compatible broker: idempotent producer plus a single consumer subscription.
///
/// # Example
///
/// ```no_run
/// use outbox_redpanda::RedpandaBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::new("localhost:9092")?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    /// Kafka producer for publishing events
    producer: FutureProducer,
    /// Broker addresses (for creating the consumer)
    brokers: String,
    client_id: String,
    /// Producer timeout
    timeout: Duration,
    /// Where a group without committed offsets starts reading
    auto_offset_reset: String,
    /// Set while a [`RedpandaConsumer`] is alive
    subscribed: Arc<AtomicBool>,
}

impl RedpandaBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Subscribe `group` to `topic` with manual commits.
    ///
    /// Only one subscription may be open per broker handle; dropping or
    /// closing the consumer releases it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if a subscription is already
    /// open or the consumer cannot be created.
    pub fn subscribe(&self, topic: &str, group: &str) -> Result<RedpandaConsumer, BrokerError> {
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrokerError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: "only one consumer per process is supported".to_string(),
            });
        }

        let consumer = self.create_consumer(topic, group).inspect_err(|_| {
            self.subscribed.store(false, Ordering::Release);
        })?;

        tracing::info!(
            topic = %topic,
            consumer_group = %group,
            auto_offset_reset = %self.auto_offset_reset,
            manual_commit = true,
            "Subscribed to topic"
        );

        Ok(RedpandaConsumer {
            consumer,
            topic: topic.to_string(),
            subscribed: Arc::clone(&self.subscribed),
            closed: false,
        })
    }

    fn create_consumer(&self, topic: &str, group: &str) -> Result<StreamConsumer, BrokerError> {
        let subscription_failed = |reason: String| BrokerError::SubscriptionFailed {
            topic: topic.to_string(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("client.id", &self.client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("allow.auto.create.topics", "true")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;
        Ok(consumer)
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the client id reported to the cluster.
    ///
    /// Default: `"outbox-relay"`
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the producer delivery timeout.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set where a consumer group without committed offsets starts reading
    /// (`"earliest"` or `"latest"`).
    ///
    /// Default: `"latest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let client_id = self.client_id.unwrap_or_else(|| "outbox-relay".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "1")
            .set("message.send.max.retries", "8")
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            client_id = %client_id,
            idempotent = true,
            "RedpandaBroker created"
        );

        Ok(RedpandaBroker {
            producer,
            brokers,
            client_id,
            timeout,
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
            subscribed: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn headers_for(payload: &serde_json::Value) -> OwnedHeaders {
    message_headers(payload)
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value.as_str()),
            })
        })
}

impl EventProducer for RedpandaBroker {
    fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        key: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        let body = serde_json::to_vec(payload);
        let headers = headers_for(payload);

        Box::pin(async move {
            let body = body.map_err(|e| BrokerError::SerializationFailed(e.to_string()))?;

            let mut record = FutureRecord::<str, Vec<u8>>::to(&topic)
                .payload(&body)
                .headers(headers);
            if let Some(key) = key.as_deref() {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = ?key,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(BrokerError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }
}

/// The single consumer subscription of a [`RedpandaBroker`].
pub struct RedpandaConsumer {
    consumer: StreamConsumer,
    topic: String,
    subscribed: Arc<AtomicBool>,
    closed: bool,
}

impl RedpandaConsumer {
    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.consumer.unsubscribe();
            self.subscribed.store(false, Ordering::Release);
        }
    }
}

impl Drop for RedpandaConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

impl MessageSource for RedpandaConsumer {
    fn next_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<InboundMessage, BrokerError>>> + Send + '_>>
    {
        Box::pin(async move {
            if self.closed {
                return None;
            }
            let received = self.consumer.recv().await.map(|message| InboundMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec),
            });
            Some(received.map_err(|e| BrokerError::TransportError(format!("Failed to receive message: {e}"))))
        })
    }

    fn commit<'a>(
        &'a mut self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let commit_failed = |reason: String| BrokerError::CommitFailed {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                reason,
            };

            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(
                    &message.topic,
                    message.partition,
                    Offset::Offset(message.next_offset()),
                )
                .map_err(|e| commit_failed(e.to_string()))?;
            self.consumer
                .commit(&offsets, CommitMode::Async)
                .map_err(|e| commit_failed(e.to_string()))?;

            tracing::trace!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.next_offset(),
                "Offset committed"
            );
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.release();
            tracing::info!(topic = %self.topic, "Consumer closed");
            Ok(())
        })
    }
}
