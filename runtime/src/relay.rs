//! Outbox relay: drains the outbox into the broker.
//!
//! Each cycle claims a batch of records, publishes them in claim order and
//! persists every per-record outcome in one transaction. The claim step is the
//! only coordination point between relay replicas; any number of them can poll
//! the same store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ claim_batch ┌─────────────┐ publish ┌──────────┐
//! │ OutboxStore  │────────────►│ OutboxRelay │────────►│  Broker  │
//! │              │◄────────────│             │         │          │
//! └──────────────┘   resolve   └─────────────┘         └──────────┘
//! ```
//!
//! # Outcomes
//!
//! - publish acknowledged: PUBLISHED
//! - publish failed, attempts remain: retry after backoff
//! - publish failed, attempts exhausted: `<topic>.outbox.dlq`, then DEAD_LETTERED
//! - no route: `outbox.unknown-topic`, then DEAD_LETTERED
//! - dead-letter publish failed: retry after backoff, never terminal
//!
//! When a record is scheduled for retry, later records of the same aggregate
//! in the batch are released untouched. The store does not hand them out again
//! while that record is backing off or leased by a live worker, so they cannot
//! overtake it in a later cycle or on another replica.

use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::retry::RetryPolicy;
use chrono::{DateTime, SecondsFormat, Utc};
use outbox_core::broker::EventProducer;
use outbox_core::environment::Clock;
use outbox_core::outbox::{ClaimRequest, OutboxError, OutboxRecord, OutboxStore, RecordOutcome, ResolvedRecord};
use outbox_core::routing::{TopicRouter, UNKNOWN_TOPIC_SINK, default_routes, outbox_dlq_topic};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// Errors that abort a whole relay cycle.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Claiming or resolving failed; the next tick starts over.
    #[error(transparent)]
    Store(#[from] OutboxError),
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records leased.
    pub claimed: usize,
    /// Records published to their topic.
    pub published: usize,
    /// Records scheduled for another attempt.
    pub retried: usize,
    /// Records quarantined in a dead-letter sink.
    pub dead_lettered: usize,
    /// Records released behind a failed record of the same aggregate.
    pub deferred: usize,
    /// The cycle did not run because another one was in progress.
    pub skipped: bool,
}

impl CycleReport {
    fn count(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Published => self.published += 1,
            RecordOutcome::Retry { .. } => self.retried += 1,
            RecordOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            RecordOutcome::Deferred { .. } => self.deferred += 1,
        }
    }
}

/// Resets the busy flag when a cycle ends, including on early return.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polling worker that moves outbox records to the broker.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    producer: Arc<dyn EventProducer>,
    clock: Arc<dyn Clock>,
    router: TopicRouter,
    backoff: RetryPolicy,
    config: RelayConfig,
    busy: AtomicBool,
}

impl OutboxRelay {
    /// Create a relay with the default routing table and backoff schedule.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: Arc<dyn EventProducer>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            backoff: RetryPolicy::relay(config.max_retries as usize),
            store,
            producer,
            clock,
            router: default_routes(),
            config,
            busy: AtomicBool::new(false),
        }
    }

    /// Replace the routing table.
    #[must_use]
    pub fn with_router(mut self, router: TopicRouter) -> Self {
        self.router = router;
        self
    }

    /// Replace the backoff schedule. `max_retries` keeps coming from the config.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Identity written into `locked_by`.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until a shutdown signal arrives.
    ///
    /// A tick that fires while a cycle is still running is skipped. A cycle in
    /// progress when the signal arrives runs to completion first.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(worker_id = %self.config.worker_id, "Outbox relay received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!(worker_id = %self.config.worker_id, error = %e, "Outbox relay cycle failed");
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Outbox relay stopped");
    }

    /// Run one claim-publish-resolve cycle.
    ///
    /// Returns a report with `skipped` set if another cycle of this relay is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] if claiming or resolving fails. Records claimed
    /// by a cycle whose resolve failed stay leased until the staleness window passes.
    pub async fn run_cycle(&self) -> Result<CycleReport, RelayError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(worker_id = %self.config.worker_id, "Previous cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }
        let _guard = BusyGuard(&self.busy);

        let started = Instant::now();
        match self.cycle().await {
            Ok(report) => {
                RelayMetrics::record_cycle(&report, started.elapsed());
                Ok(report)
            },
            Err(e) => {
                RelayMetrics::record_cycle_error();
                Err(e)
            },
        }
    }

    async fn cycle(&self) -> Result<CycleReport, RelayError> {
        let claimed = self
            .store
            .claim_batch(ClaimRequest {
                worker_id: self.config.worker_id.clone(),
                batch_size: self.config.batch_size,
                stale_after: self.config.stale_lock,
                now: self.clock.now(),
            })
            .await?;

        if claimed.is_empty() {
            return Ok(CycleReport::default());
        }

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..CycleReport::default()
        };
        let mut blocked: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut resolutions = Vec::with_capacity(claimed.len());

        for record in &claimed {
            let outcome = match blocked.get(record.aggregate_id.as_str()) {
                Some(next_attempt_at) => RecordOutcome::Deferred {
                    next_attempt_at: *next_attempt_at,
                },
                None => self.deliver(record).await,
            };

            if let RecordOutcome::Retry { next_attempt_at, .. } = &outcome {
                blocked.insert(record.aggregate_id.as_str(), *next_attempt_at);
            }
            report.count(&outcome);
            resolutions.push(ResolvedRecord {
                id: record.id,
                outcome,
                resolved_at: self.clock.now(),
            });
        }

        let updated = self.store.resolve(&self.config.worker_id, resolutions).await?;
        if updated < claimed.len() {
            tracing::warn!(
                worker_id = %self.config.worker_id,
                claimed = claimed.len(),
                updated,
                "Some leases were lost before the batch was resolved"
            );
        }

        tracing::info!(
            worker_id = %self.config.worker_id,
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "Processed outbox batch"
        );
        Ok(report)
    }

    async fn deliver(&self, record: &OutboxRecord) -> RecordOutcome {
        let routing_key = record.routing_key();
        let Some(topic) = self.router.topic_for(&routing_key) else {
            return self.quarantine_unroutable(record, &routing_key).await;
        };

        let message = record.envelope();
        match self
            .producer
            .publish(topic, &message, Some(&record.aggregate_id))
            .await
        {
            Ok(()) => {
                tracing::debug!(outbox_id = %record.id, topic, "Outbox record published");
                RecordOutcome::Published
            },
            Err(e) => self.publish_failed(record, topic, message, e.to_string()).await,
        }
    }

    async fn publish_failed(
        &self,
        record: &OutboxRecord,
        topic: &str,
        message: serde_json::Value,
        error: String,
    ) -> RecordOutcome {
        let attempts = record.retry_count.saturating_add(1);
        let max_retries = i32::try_from(self.config.max_retries).unwrap_or(i32::MAX);

        if attempts < max_retries {
            tracing::warn!(outbox_id = %record.id, topic, attempt = attempts, error = %error, "Outbox publish failed, will retry");
            return RecordOutcome::Retry {
                next_attempt_at: self.next_attempt_at(attempts),
                error,
            };
        }

        let dlq_topic = outbox_dlq_topic(topic);
        let dead_letter = json!({
            "originalTopic": topic,
            "outboxId": record.id.to_string(),
            "aggregateId": record.aggregate_id,
            "error": error,
            "payload": message,
            "attempts": attempts,
            "deadLetteredAt": self.timestamp(),
        });

        match self
            .producer
            .publish(&dlq_topic, &dead_letter, Some(&record.aggregate_id))
            .await
        {
            Ok(()) => {
                tracing::error!(outbox_id = %record.id, topic, dlq_topic = %dlq_topic, attempts, error = %error, "Outbox record dead-lettered");
                RecordOutcome::DeadLettered {
                    topic: dlq_topic,
                    error,
                    failed_attempt: true,
                }
            },
            Err(dlq_error) => {
                // No retry ceiling here: the record stays pending until a sink accepts it.
                tracing::error!(outbox_id = %record.id, dlq_topic = %dlq_topic, error = %dlq_error, "Dead-letter publish failed, will retry");
                RecordOutcome::Retry {
                    next_attempt_at: self.next_attempt_at(attempts),
                    error: format!("DLQ publish failed: {dlq_error}; original error: {error}"),
                }
            },
        }
    }

    async fn quarantine_unroutable(&self, record: &OutboxRecord, routing_key: &str) -> RecordOutcome {
        let error = format!("No topic mapping for {routing_key}");
        let dead_letter = json!({
            "routingKey": routing_key,
            "outboxId": record.id.to_string(),
            "aggregateId": record.aggregate_id,
            "error": error,
            "payload": record.envelope(),
            "attempts": record.retry_count,
            "deadLetteredAt": self.timestamp(),
        });

        match self
            .producer
            .publish(UNKNOWN_TOPIC_SINK, &dead_letter, Some(&record.aggregate_id))
            .await
        {
            Ok(()) => {
                tracing::error!(outbox_id = %record.id, routing_key, "Unroutable outbox record dead-lettered");
                RecordOutcome::DeadLettered {
                    topic: UNKNOWN_TOPIC_SINK.to_string(),
                    error,
                    failed_attempt: false,
                }
            },
            Err(sink_error) => {
                tracing::error!(outbox_id = %record.id, routing_key, error = %sink_error, "Unknown-topic sink publish failed, will retry");
                RecordOutcome::Retry {
                    next_attempt_at: self.next_attempt_at(record.retry_count.saturating_add(1)),
                    error: format!("DLQ publish failed: {sink_error}; original error: {error}"),
                }
            },
        }
    }

    fn next_attempt_at(&self, attempts: i32) -> DateTime<Utc> {
        let delay = self
            .backoff
            .backoff_with_jitter(u32::try_from(attempts).unwrap_or(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn timestamp(&self) -> String {
        self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
