//! Broker abstraction: the publish primitive and the consumer-side message source.
//!
//! Both the outbox relay and the consumer runtime's dead-letter path publish
//! through [`EventProducer`]. A consumer runtime pulls from exactly one
//! [`MessageSource`], which represents one (topic, group) subscription.
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a publish that fails may still have been written, and a
//!   message whose offset was not committed is delivered again after a restart.
//! - **Ordered per key**: messages published with the same key land on the same
//!   partition and are consumed in publish order.
//! - **Manual commits**: a source commits an offset only when asked to.
//!
//! # Implementations
//!
//! - `RedpandaBroker` (in `outbox-redpanda`): rdkafka-backed, for production
//! - `InMemoryBroker` (in `outbox-testing`): partitioned in-memory log for tests

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Header carrying the payload media type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Header carrying the `eventType` of the published payload.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Header carrying the `eventId` of the published payload.
pub const EVENT_ID_HEADER: &str = "x-event-id";

/// Media type of every published payload.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to create a client or reach the cluster.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not acknowledge a write.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit a consumed offset.
    #[error("Commit failed for {topic}@{partition}:{offset}: {reason}")]
    CommitFailed {
        /// Topic of the message.
        topic: String,
        /// Partition of the message.
        partition: i32,
        /// Offset of the message.
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Failed to encode a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Network or transport error while receiving.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Raw body. `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

impl InboundMessage {
    /// Offset to commit once this message reached a terminal outcome.
    #[must_use]
    pub const fn next_offset(&self) -> i64 {
        self.offset + 1
    }

    /// Whether the message has no usable body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.as_ref().is_none_or(Vec::is_empty)
    }
}

/// Transport headers attached to every published payload.
///
/// `x-event-type` and `x-event-id` are read from the payload's `eventType` and
/// `eventId` fields and are empty when those are absent.
#[must_use]
pub fn message_headers(payload: &serde_json::Value) -> [(&'static str, String); 3] {
    let field = |name: &str| match payload.get(name) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    [
        (CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE.to_string()),
        (EVENT_TYPE_HEADER, field("eventType")),
        (EVENT_ID_HEADER, field("eventId")),
    ]
}

/// Durable publish primitive.
///
/// Implementations attach [`message_headers`], publish the JSON payload with the
/// given partition key and resolve only once the broker acknowledged the write.
/// Transport-level retries stay inside the implementation (idempotent producer);
/// application-level retries are the caller's job.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the producer can be shared as
/// `Arc<dyn EventProducer>` between the relay and a consumer runtime.
pub trait EventProducer: Send + Sync {
    /// Publish a JSON payload to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the write was not acknowledged, or
    /// [`BrokerError::SerializationFailed`] if the payload cannot be encoded.
    fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        key: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// One subscription's stream of messages with manual offset commits.
pub trait MessageSource: Send + Sync {
    /// Wait for the next message.
    ///
    /// Returns `None` once the source is exhausted or closed.
    fn next_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<InboundMessage, BrokerError>>> + Send + '_>>;

    /// Commit progress past `message` (stores `offset + 1`).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the commit was rejected.
    fn commit<'a>(
        &'a mut self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;

    /// Leave the group and release the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportError`] if the session could not be closed cleanly.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_taken_from_the_payload() {
        let payload = serde_json::json!({ "eventId": "e-1", "eventType": "OrderCreatedEvent" });
        let headers = message_headers(&payload);
        assert_eq!(headers[0], ("content-type", "application/json".to_string()));
        assert_eq!(headers[1], ("x-event-type", "OrderCreatedEvent".to_string()));
        assert_eq!(headers[2], ("x-event-id", "e-1".to_string()));
    }

    #[test]
    fn missing_identity_yields_empty_headers() {
        let headers = message_headers(&serde_json::json!({ "originalTopic": "order.created" }));
        assert_eq!(headers[1].1, "");
        assert_eq!(headers[2].1, "");
    }

    #[test]
    fn empty_and_tombstone_messages_are_empty() {
        let mut message = InboundMessage {
            topic: "order.created".into(),
            partition: 0,
            offset: 41,
            key: None,
            payload: None,
        };
        assert!(message.is_empty());
        message.payload = Some(Vec::new());
        assert!(message.is_empty());
        message.payload = Some(b"{}".to_vec());
        assert!(!message.is_empty());
        assert_eq!(message.next_offset(), 42);
    }

    #[test]
    fn publish_error_display_names_topic() {
        let error = BrokerError::PublishFailed {
            topic: "order.created".into(),
            reason: "broker unreachable".into(),
        };
        let display = format!("{error}");
        assert!(display.contains("order.created"));
        assert!(display.contains("broker unreachable"));
    }
}
