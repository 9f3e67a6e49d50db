//! Integration tests for [`RedpandaBroker`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish with headers and keys
//! - Manual commits and resumption from the committed offset
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p outbox-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use outbox_core::broker::{EventProducer, InboundMessage, MessageSource};
use outbox_redpanda::{RedpandaBroker, RedpandaConsumer};
use serde_json::json;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return the container (to keep it alive) and its bootstrap address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Publish until the cluster accepts writes.
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(broker) = RedpandaBroker::builder()
            .brokers(brokers)
            .timeout(Duration::from_secs(5))
            .build()
        {
            if broker.publish("warmup-topic", &json!({}), None).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

async fn receive(source: &mut RedpandaConsumer) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(30), source.next_message())
        .await
        .expect("Timeout waiting for message")
        .expect("Source ended")
        .expect("Failed to receive message")
}

fn event(event_id: &str) -> serde_json::Value {
    json!({
        "eventId": event_id,
        "eventType": "OrderCreatedEvent",
        "aggregateId": "order-1",
        "occurredAt": "2025-01-01T00:00:00.000Z",
        "orderId": "order-1"
    })
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn published_messages_arrive_with_key_and_body() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = RedpandaBroker::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create broker");

    broker
        .publish("order.created", &event("e-1"), Some("order-1"))
        .await
        .expect("Failed to publish");

    let mut source = broker
        .subscribe("order.created", "round-trip")
        .expect("Failed to subscribe");
    let message = receive(&mut source).await;

    assert_eq!(message.key.as_deref(), Some("order-1"));
    let body: serde_json::Value =
        serde_json::from_slice(message.payload.as_deref().expect("payload")).expect("json");
    assert_eq!(body["eventId"], "e-1");
    source.commit(&message).await.expect("Failed to commit");
    source.close().await.expect("Failed to close");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn new_subscription_resumes_after_the_committed_offset() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = RedpandaBroker::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create broker");

    for id in ["e-1", "e-2"] {
        broker
            .publish("order.confirmed", &event(id), Some("order-1"))
            .await
            .expect("Failed to publish");
    }

    let mut source = broker
        .subscribe("order.confirmed", "resume")
        .expect("Failed to subscribe");
    let first = receive(&mut source).await;
    source.commit(&first).await.expect("Failed to commit");
    // Async commits are flushed when the consumer leaves the group.
    tokio::time::sleep(Duration::from_secs(1)).await;
    source.close().await.expect("Failed to close");
    drop(source);

    let mut source = broker
        .subscribe("order.confirmed", "resume")
        .expect("Failed to resubscribe");
    let next = receive(&mut source).await;
    assert_eq!(next.offset, first.offset + 1);
    let body: serde_json::Value =
        serde_json::from_slice(next.payload.as_deref().expect("payload")).expect("json");
    assert_eq!(body["eventId"], "e-2");
}
