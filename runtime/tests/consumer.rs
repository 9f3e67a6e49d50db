//! Integration tests for the consumer runtime against the in-memory broker.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use async_trait::async_trait;
use outbox_core::broker::{EventProducer, InboundMessage, MessageSource};
use outbox_core::schema::default_schemas;
use outbox_runtime::{
    ConsumerError, ConsumerRuntime, DeadLetterReason, HandlerError, MessageContext,
    MessageHandler, MessageOutcome, RetryPolicy,
};
use outbox_testing::helpers::init_test_tracing;
use outbox_testing::{InMemoryBroker, test_clock};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOPIC: &str = "payment.processed";
const GROUP: &str = "order-payment-processed";

/// Fails a scripted number of times, then succeeds. Asserts that nothing was
/// committed for the message while it is still being attempted.
struct ScriptedHandler {
    broker: Arc<InMemoryBroker>,
    failures_left: AtomicU32,
    calls: AtomicU32,
    handled: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedHandler {
    fn new(broker: &Arc<InMemoryBroker>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::clone(broker),
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            handled: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(
        &self,
        message: &serde_json::Value,
        context: &MessageContext,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let committed = self
            .broker
            .committed_offset(GROUP, &context.topic, context.partition)
            .unwrap_or(0);
        assert!(committed <= context.offset, "offset committed while still processing");

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(HandlerError::new(format!("downstream timeout (attempt {})", context.attempt)));
        }
        self.handled.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn payment(event_id: &str, order_id: &str) -> serde_json::Value {
    json!({
        "eventId": event_id,
        "eventType": "PaymentProcessedEvent",
        "aggregateId": format!("pay-{order_id}"),
        "occurredAt": "2025-01-01T00:00:00.000Z",
        "orderId": order_id,
        "status": "SUCCESS",
        "amount": 42.5,
        "currency": "USD"
    })
}

fn runtime(
    broker: &Arc<InMemoryBroker>,
    handler: Arc<ScriptedHandler>,
    max_attempts: u32,
) -> ConsumerRuntime {
    let source = broker.subscribe(TOPIC, GROUP).unwrap();
    ConsumerRuntime::new(
        Box::new(source),
        broker.clone(),
        handler,
        Arc::new(test_clock()),
        max_attempts,
    )
    .with_schemas(default_schemas())
    .with_retry_policy(RetryPolicy {
        jitter: Duration::ZERO,
        ..RetryPolicy::consumer(max_attempts as usize)
    })
}

/// The stored message at `offset` of the partition `key` hashes to.
fn stored(broker: &InMemoryBroker, key: &str, offset: i64) -> InboundMessage {
    let message = broker
        .messages_for_key(TOPIC, key)
        .into_iter()
        .find(|m| m.offset == offset)
        .unwrap();
    InboundMessage {
        topic: TOPIC.to_string(),
        partition: message.partition,
        offset: message.offset,
        key: message.key,
        payload: Some(serde_json::to_vec(&message.payload).unwrap()),
    }
}

fn raw(partition: i32, offset: i64, body: &[u8]) -> InboundMessage {
    InboundMessage {
        topic: TOPIC.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(body.to_vec()),
    }
}

async fn run_to_end(runtime: ConsumerRuntime) {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    runtime.run(shutdown_rx).await.unwrap();
}

#[tokio::test]
async fn invalid_json_is_dead_lettered_without_calling_the_handler() {
    init_test_tracing();
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    let (partition, offset) = broker.inject_raw(TOPIC, Some("pay-1"), Some(b"{not json".to_vec()));

    run_to_end(runtime(&broker, handler.clone(), 5)).await;

    assert_eq!(handler.calls(), 0);
    let dead_letters = broker.messages("payment.processed.dlq");
    assert_eq!(dead_letters.len(), 1);
    let body = &dead_letters[0].payload;
    assert_eq!(body["originalTopic"], TOPIC);
    assert_eq!(body["originalPartition"], partition);
    assert_eq!(body["originalOffset"], offset);
    assert_eq!(body["raw"], "{not json");
    assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON:"));
    assert_eq!(dead_letters[0].key.as_deref(), Some(offset.to_string().as_str()));
    assert_eq!(broker.committed_offset(GROUP, TOPIC, partition), Some(offset + 1));
}

#[tokio::test]
async fn empty_messages_are_committed_and_dropped() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    let (partition, offset) = broker.inject_raw(TOPIC, Some("pay-1"), Some(Vec::new()));
    let mut runtime = runtime(&broker, handler.clone(), 5);

    let message = raw(partition, offset, b"");
    assert_eq!(runtime.process_message(&message).await.unwrap(), MessageOutcome::Dropped);

    assert_eq!(handler.calls(), 0);
    assert!(broker.messages("payment.processed.dlq").is_empty());
    assert_eq!(broker.committed_offset(GROUP, TOPIC, partition), Some(offset + 1));
}

#[tokio::test]
async fn schema_violations_are_dead_lettered() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    let mut invalid = payment("e-1", "order-1");
    invalid["status"] = json!("PENDING");
    broker.publish(TOPIC, &invalid, Some("pay-order-1")).await.unwrap();

    run_to_end(runtime(&broker, handler.clone(), 5)).await;

    assert_eq!(handler.calls(), 0);
    let dead_letters = broker.messages("payment.processed.dlq");
    assert_eq!(dead_letters.len(), 1);
    let body = &dead_letters[0].payload;
    assert!(body["error"].as_str().unwrap().starts_with("Schema validation failed:"));
    assert_eq!(body["payload"]["eventId"], "e-1");
    assert_eq!(broker.commit_log().len(), 1);
}

#[tokio::test]
async fn topics_without_schema_only_need_valid_json() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    let source = broker.subscribe("audit.logged", GROUP).unwrap();
    broker
        .publish("audit.logged", &json!({ "anything": true }), None)
        .await
        .unwrap();

    let runtime = ConsumerRuntime::new(
        Box::new(source),
        broker.clone(),
        handler.clone(),
        Arc::new(test_clock()),
        5,
    )
    .with_schemas(default_schemas());
    run_to_end(runtime).await;

    assert_eq!(handler.calls(), 1);
    assert!(broker.messages("audit.logged.dlq").is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_handler_failures_are_retried_before_commit() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 2);
    broker
        .publish(TOPIC, &payment("e-1", "order-1"), Some("pay-order-1"))
        .await
        .unwrap();
    let mut runtime = runtime(&broker, handler.clone(), 5);

    let message = stored(&broker, "pay-order-1", 0);
    let outcome = runtime.process_message(&message).await.unwrap();

    assert_eq!(outcome, MessageOutcome::Handled { attempts: 3 });
    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.commit_log(), vec![(TOPIC.to_string(), message.partition, message.offset + 1)]);
    assert!(broker.messages("payment.processed.dlq").is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_handler_attempts_dead_letter_then_commit() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, u32::MAX);
    broker
        .publish(TOPIC, &payment("e-1", "order-1"), Some("pay-order-1"))
        .await
        .unwrap();
    let mut runtime = runtime(&broker, handler.clone(), 3);

    let message = stored(&broker, "pay-order-1", 0);
    let outcome = runtime.process_message(&message).await.unwrap();

    assert_eq!(
        outcome,
        MessageOutcome::DeadLettered {
            reason: DeadLetterReason::HandlerExhausted
        }
    );
    assert_eq!(handler.calls(), 3);
    let dead_letters = broker.messages("payment.processed.dlq");
    assert_eq!(dead_letters.len(), 1);
    let body = &dead_letters[0].payload;
    assert_eq!(body["attempts"], 3);
    assert_eq!(body["payload"]["orderId"], "order-1");
    assert!(body["error"].as_str().unwrap().contains("attempt 3"));
    assert_eq!(
        broker.committed_offset(GROUP, TOPIC, message.partition),
        Some(message.offset + 1)
    );
}

#[tokio::test]
async fn failed_dead_letter_publish_leaves_the_offset_uncommitted() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    let (partition, offset) = broker.inject_raw(TOPIC, None, Some(b"<xml/>".to_vec()));
    broker.fail_all_publishes("payment.processed.dlq");
    let mut runtime = runtime(&broker, handler, 5);

    let message = raw(partition, offset, b"<xml/>");
    let err = runtime.process_message(&message).await.unwrap_err();

    assert!(matches!(err, ConsumerError::DeadLetterFailed { ref topic, .. } if topic == "payment.processed.dlq"));
    assert!(broker.commit_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_loop_reprocesses_until_the_dead_letter_is_accepted() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    broker.inject_raw(TOPIC, None, Some(b"<xml/>".to_vec()));
    broker.fail_publishes("payment.processed.dlq", 2);

    run_to_end(runtime(&broker, handler, 5)).await;

    assert_eq!(broker.publish_attempts("payment.processed.dlq"), 3);
    assert_eq!(broker.messages("payment.processed.dlq").len(), 1);
    assert_eq!(broker.commit_log().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_commit_redelivers_the_message() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    broker
        .publish(TOPIC, &payment("e-1", "order-1"), Some("pay-order-1"))
        .await
        .unwrap();
    broker.fail_commits(1);

    run_to_end(runtime(&broker, handler.clone(), 5)).await;

    // At-least-once: the handler saw the message twice.
    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.commit_log().len(), 1);
}

#[tokio::test]
async fn uncommitted_messages_are_redelivered_to_the_next_subscription() {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .publish(TOPIC, &payment("e-1", "order-1"), Some("pay-order-1"))
        .await
        .unwrap();

    // Crash before any terminal outcome: the subscription goes away uncommitted.
    {
        let mut source = broker.subscribe(TOPIC, GROUP).unwrap();
        let first = source.next_message().await.unwrap().unwrap();
        assert_eq!(first.offset, 0);
    }

    let handler = ScriptedHandler::new(&broker, 0);
    run_to_end(runtime(&broker, handler.clone(), 5)).await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(handler.handled.lock().unwrap()[0]["eventId"], "e-1");
}

#[tokio::test]
async fn messages_of_one_key_are_handled_in_publish_order() {
    let broker = Arc::new(InMemoryBroker::new());
    for n in 0..5 {
        broker
            .publish(TOPIC, &payment(&format!("e-{n}"), "order-1"), Some("pay-order-1"))
            .await
            .unwrap();
    }
    let handler = ScriptedHandler::new(&broker, 0);

    run_to_end(runtime(&broker, handler.clone(), 5)).await;

    let handled: Vec<String> = handler
        .handled
        .lock()
        .unwrap()
        .iter()
        .map(|m| m["eventId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(handled, ["e-0", "e-1", "e-2", "e-3", "e-4"]);
}

#[tokio::test]
async fn only_one_subscription_per_broker_handle() {
    let broker = Arc::new(InMemoryBroker::new());
    let first = broker.subscribe(TOPIC, GROUP).unwrap();
    assert!(broker.subscribe("order.created", "other-group").is_err());
    drop(first);
    assert!(broker.subscribe("order.created", "other-group").is_ok());
}

#[tokio::test]
async fn shutdown_closes_the_subscription() {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = ScriptedHandler::new(&broker, 0);
    let source = broker.subscribe(TOPIC, GROUP).unwrap().follow();
    let runtime = ConsumerRuntime::new(
        Box::new(source),
        broker.clone(),
        handler.clone(),
        Arc::new(test_clock()),
        5,
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let task = tokio::spawn(runtime.run(shutdown_rx));

    broker
        .publish(TOPIC, &payment("e-1", "order-1"), Some("pay-order-1"))
        .await
        .unwrap();
    for _ in 0..100 {
        if handler.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(handler.calls(), 1);
    assert!(broker.subscribe(TOPIC, GROUP).is_ok());
}
