//! Consumer runtime: turns one topic subscription into handler invocations.
//!
//! Messages are processed strictly one at a time. Each message ends in exactly
//! one terminal outcome, and its offset is committed only then:
//!
//! ```text
//! RECEIVED ─► empty body ──────────────────────────────► commit (dropped)
//!    │
//!    └─► VALIDATING ─► invalid JSON ─────► <topic>.dlq ─► commit
//!            │
//!            ├─► schema violation ───────► <topic>.dlq ─► commit
//!            │
//!            └─► PROCESSING ─► handler ok ──────────────► commit
//!                    │
//!                    └─► attempts exhausted ─► <topic>.dlq ─► commit
//! ```
//!
//! A message whose dead-letter publish fails is not committed; the runtime
//! backs off and processes it again from the start. Handlers must therefore be
//! idempotent: a crash or a failed commit redelivers the message.

use crate::metrics::ConsumerMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::SecondsFormat;
use outbox_core::broker::{BrokerError, EventProducer, InboundMessage, MessageSource};
use outbox_core::environment::Clock;
use outbox_core::repository::RepositoryError;
use outbox_core::routing::consumer_dlq_topic;
use outbox_core::schema::SchemaRegistry;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// A downstream handler failed to process a message.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Wrap any displayable failure.
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

impl From<RepositoryError> for HandlerError {
    fn from(error: RepositoryError) -> Self {
        Self::new(error)
    }
}

/// Errors that prevent a message from reaching a terminal outcome.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Receiving, committing or closing failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The dead-letter topic did not accept the message.
    #[error("Dead-letter publish to '{topic}' failed: {source}")]
    DeadLetterFailed {
        /// The dead-letter topic.
        topic: String,
        /// The publish failure.
        source: BrokerError,
    },
}

/// Where a handler invocation comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Business logic invoked for every valid message of a subscription.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
///
/// struct AuditHandler;
///
/// #[async_trait]
/// impl MessageHandler for AuditHandler {
///     async fn handle(&self, message: &serde_json::Value, context: &MessageContext) -> Result<(), HandlerError> {
///         tracing::info!(topic = %context.topic, event_id = %message["eventId"], "audited");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one parsed, validated message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] to request a retry. After the last attempt the
    /// message is dead-lettered.
    async fn handle(
        &self,
        message: &serde_json::Value,
        context: &MessageContext,
    ) -> Result<(), HandlerError>;
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The body was not valid JSON.
    MalformedJson,
    /// The body failed its topic's schema.
    SchemaViolation,
    /// Every handler attempt failed.
    HandlerExhausted,
}

impl DeadLetterReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedJson => "malformed_json",
            Self::SchemaViolation => "schema_violation",
            Self::HandlerExhausted => "handler_exhausted",
        }
    }
}

/// Terminal outcome of one message. The offset has been committed for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Empty body, skipped.
    Dropped,
    /// The handler succeeded.
    Handled {
        /// Attempts it took.
        attempts: u32,
    },
    /// Forwarded to `<topic>.dlq`.
    DeadLettered {
        /// Why.
        reason: DeadLetterReason,
    },
}

/// Drives one subscription.
pub struct ConsumerRuntime {
    source: Box<dyn MessageSource>,
    producer: Arc<dyn EventProducer>,
    handler: Arc<dyn MessageHandler>,
    clock: Arc<dyn Clock>,
    schemas: SchemaRegistry,
    retry: RetryPolicy,
}

impl ConsumerRuntime {
    /// Create a runtime without schemas, making up to `max_attempts` handler attempts.
    #[must_use]
    pub fn new(
        source: Box<dyn MessageSource>,
        producer: Arc<dyn EventProducer>,
        handler: Arc<dyn MessageHandler>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            source,
            producer,
            handler,
            clock,
            schemas: SchemaRegistry::new(),
            retry: RetryPolicy::consumer(max_attempts as usize),
        }
    }

    /// Validate messages against `schemas` before handling them.
    #[must_use]
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Replace the handler backoff schedule (including the attempt limit).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Consume until the source ends or a shutdown signal arrives, then close the source.
    ///
    /// A message being processed when the signal arrives is finished first.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Broker`] if the source cannot be closed cleanly.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ConsumerError> {
        tracing::info!("Consumer runtime started");
        let mut receive_failures = 0u32;

        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Consumer runtime received shutdown signal");
                    break;
                }
                next = self.source.next_message() => next,
            };

            let message = match next {
                Some(Ok(message)) => {
                    receive_failures = 0;
                    message
                },
                Some(Err(e)) => {
                    receive_failures = receive_failures.saturating_add(1);
                    tracing::error!(error = %e, "Failed to receive message");
                    if Self::pause(&self.retry, receive_failures, &mut shutdown).await {
                        break;
                    }
                    continue;
                },
                None => {
                    tracing::info!("Message source closed");
                    break;
                },
            };

            if self.process_until_terminal(&message, &mut shutdown).await {
                break;
            }
        }

        self.source.close().await?;
        tracing::info!("Consumer runtime stopped");
        Ok(())
    }

    /// Process a message, starting over after failures that left it uncommitted.
    ///
    /// Returns `true` if shutdown was requested while waiting to start over.
    async fn process_until_terminal(
        &mut self,
        message: &InboundMessage,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let mut failures = 0u32;
        loop {
            match self.process_message(message).await {
                Ok(outcome) => {
                    tracing::debug!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        ?outcome,
                        "Message reached terminal outcome"
                    );
                    return false;
                },
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Message left uncommitted, processing it again"
                    );
                    if Self::pause(&self.retry, failures, shutdown).await {
                        return true;
                    }
                },
            }
        }
    }

    /// Back off before trying again; `true` if shutdown arrived meanwhile.
    async fn pause(retry: &RetryPolicy, failures: u32, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = shutdown.recv() => true,
            () = tokio::time::sleep(retry.backoff_with_jitter(failures)) => false,
        }
    }

    /// Take one message to its terminal outcome and commit its offset.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError`] if a dead-letter publish or the commit failed;
    /// the offset is not committed then.
    pub async fn process_message(
        &mut self,
        message: &InboundMessage,
    ) -> Result<MessageOutcome, ConsumerError> {
        let outcome = self.evaluate(message).await?;
        self.source.commit(message).await?;
        Ok(outcome)
    }

    async fn evaluate(&self, message: &InboundMessage) -> Result<MessageOutcome, ConsumerError> {
        let Some(raw) = message.payload.as_deref().filter(|body| !body.is_empty()) else {
            tracing::warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Empty message, skipping"
            );
            return Ok(MessageOutcome::Dropped);
        };

        let parsed: serde_json::Value = match serde_json::from_slice(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                let body = json!({
                    "originalTopic": message.topic,
                    "originalPartition": message.partition,
                    "originalOffset": message.offset,
                    "error": format!("Invalid JSON: {e}"),
                    "raw": String::from_utf8_lossy(raw),
                    "receivedAt": self.timestamp(),
                });
                return self
                    .dead_letter(message, &body, DeadLetterReason::MalformedJson)
                    .await;
            },
        };

        if let Err(violation) = self.schemas.validate(&message.topic, &parsed) {
            let body = json!({
                "originalTopic": message.topic,
                "originalPartition": message.partition,
                "originalOffset": message.offset,
                "error": format!("Schema validation failed: {violation}"),
                "payload": parsed,
                "receivedAt": self.timestamp(),
            });
            return self
                .dead_letter(message, &body, DeadLetterReason::SchemaViolation)
                .await;
        }

        let max_attempts = u32::try_from(self.retry.max_retries.max(1)).unwrap_or(u32::MAX);
        let mut attempt = 1;
        loop {
            let context = MessageContext {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                attempt,
            };

            let error = match self.handler.handle(&parsed, &context).await {
                Ok(()) => {
                    ConsumerMetrics::record_handled(&message.topic);
                    return Ok(MessageOutcome::Handled { attempts: attempt });
                },
                Err(error) => error,
            };

            ConsumerMetrics::record_handler_failure(&message.topic);
            tracing::error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                attempt,
                max_attempts,
                error = %error,
                "Handler failed"
            );

            if attempt >= max_attempts {
                let body = json!({
                    "originalTopic": message.topic,
                    "originalPartition": message.partition,
                    "originalOffset": message.offset,
                    "error": error.to_string(),
                    "payload": parsed,
                    "attempts": attempt,
                    "receivedAt": self.timestamp(),
                });
                return self
                    .dead_letter(message, &body, DeadLetterReason::HandlerExhausted)
                    .await;
            }

            tokio::time::sleep(self.retry.backoff_with_jitter(attempt)).await;
            attempt += 1;
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        body: &serde_json::Value,
        reason: DeadLetterReason,
    ) -> Result<MessageOutcome, ConsumerError> {
        let topic = consumer_dlq_topic(&message.topic);
        let key = message.offset.to_string();

        if let Err(source) = self.producer.publish(&topic, body, Some(&key)).await {
            ConsumerMetrics::record_dlq_publish_failure(&message.topic);
            return Err(ConsumerError::DeadLetterFailed { topic, source });
        }

        ConsumerMetrics::record_dead_lettered(&message.topic, reason.as_str());
        tracing::warn!(
            dlq_topic = %topic,
            partition = message.partition,
            offset = message.offset,
            reason = reason.as_str(),
            "Sent message to DLQ"
        );
        Ok(MessageOutcome::DeadLettered { reason })
    }

    fn timestamp(&self) -> String {
        self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
