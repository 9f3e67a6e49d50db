//! Outbox records and the store abstraction behind them.
//!
//! An outbox record is written in the same transaction as the aggregate state
//! that produced it, then relayed to the broker by one of possibly many relay
//! workers. The lease fields (`locked_at`, `locked_by`) are the only
//! coordination point between those workers.
//!
//! # Lifecycle
//!
//! ```text
//!            claim                 publish ok
//! PENDING ──────────► LEASED ───────────────────► PUBLISHED
//!    ▲                  │
//!    │  retry / defer   │  retries exhausted + DLQ ok
//!    └──────────────────┤  or unroutable + sink ok
//!                       └───────────────────────► DEAD_LETTERED
//! ```
//!
//! A lease older than the staleness window can be reclaimed by any worker,
//! which bounds the damage of a relay that crashed mid-batch.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database connection, query or transaction failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A stored row does not match the expected shape.
    #[error("Corrupt outbox row {id}: {reason}")]
    CorruptRecord {
        /// The offending record.
        id: Uuid,
        /// What was wrong with it.
        reason: String,
    },
}

/// Derived status of an [`OutboxRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a relay worker that has not resolved it yet.
    Leased,
    /// Delivered to its business topic.
    Published,
    /// Quarantined in a dead-letter sink.
    DeadLettered,
}

impl OutboxStatus {
    /// Whether the record can never be claimed again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::DeadLettered)
    }
}

/// A durable event waiting for, or done with, relay to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Record id, equal to the event id of the domain event it carries.
    pub id: Uuid,
    /// Owning aggregate id; also the partition key.
    pub aggregate_id: String,
    /// Owning aggregate type (e.g. `"Order"`).
    pub aggregate_type: String,
    /// Event type tag (e.g. `"OrderCreatedEvent"`).
    pub event_type: String,
    /// Event-specific payload.
    pub payload: serde_json::Value,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Insertion sequence, tie-breaker for events sharing `occurred_at`.
    pub position: i64,
    /// Set once the record reached its business topic (or a dead-letter sink).
    pub published_at: Option<DateTime<Utc>>,
    /// Set once the record was quarantined.
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// The sink the record was quarantined in.
    pub dead_letter_topic: Option<String>,
    /// Failed publish attempts so far.
    pub retry_count: i32,
    /// Earliest time the record may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current lease was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker holding the current lease.
    pub locked_by: Option<String>,
    /// Last failure message.
    pub error: Option<String>,
}

impl OutboxRecord {
    /// Derive the lifecycle status from the timestamp and lease fields.
    ///
    /// Dead-lettered records also carry `published_at`, so that check comes first.
    #[must_use]
    pub const fn status(&self) -> OutboxStatus {
        if self.dead_lettered_at.is_some() {
            OutboxStatus::DeadLettered
        } else if self.published_at.is_some() {
            OutboxStatus::Published
        } else if self.locked_at.is_some() {
            OutboxStatus::Leased
        } else {
            OutboxStatus::Pending
        }
    }

    /// Whether a worker may claim this record at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        if self.published_at.is_some() || self.dead_lettered_at.is_some() {
            return false;
        }
        let due = self.next_attempt_at.is_none_or(|at| at <= now);
        let unlocked = self.locked_at.is_none_or(|at| at < stale_before);
        due && unlocked
    }

    /// Whether this record must be delivered before `later`: same aggregate,
    /// appended earlier, not terminal yet.
    #[must_use]
    pub fn precedes(&self, later: &Self) -> bool {
        self.aggregate_type == later.aggregate_type
            && self.aggregate_id == later.aggregate_id
            && !self.status().is_terminal()
            && (self.occurred_at, self.position) < (later.occurred_at, later.position)
    }

    /// Whether this record keeps later records of its aggregate out of a claim
    /// at `now`: it precedes them and cannot be claimed itself, because it is
    /// backing off or leased by a live worker.
    #[must_use]
    pub fn holds_back(&self, later: &Self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        self.precedes(later) && !self.is_claimable(now, stale_before)
    }

    /// Key used by the static routing table: `"<aggregateType>.<eventType>"`.
    #[must_use]
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.aggregate_type, self.event_type)
    }

    /// Build the published message: envelope fields merged with the event payload.
    ///
    /// Payload fields are written last and win on conflicts. A payload that is not
    /// a JSON object is nested under `"payload"`.
    #[must_use]
    pub fn envelope(&self) -> serde_json::Value {
        let mut message = serde_json::Map::new();
        message.insert("eventId".into(), self.id.to_string().into());
        message.insert("aggregateId".into(), self.aggregate_id.clone().into());
        message.insert("eventType".into(), self.event_type.clone().into());
        message.insert(
            "occurredAt".into(),
            self.occurred_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into(),
        );

        match &self.payload {
            serde_json::Value::Object(fields) => {
                for (key, value) in fields {
                    message.insert(key.clone(), value.clone());
                }
            },
            serde_json::Value::Null => {},
            other => {
                message.insert("payload".into(), other.clone());
            },
        }

        serde_json::Value::Object(message)
    }
}

/// An outbox row to be inserted alongside an aggregate's state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    /// Record id (the domain event id).
    pub id: Uuid,
    /// Owning aggregate id.
    pub aggregate_id: String,
    /// Owning aggregate type.
    pub aggregate_type: String,
    /// Event type tag.
    pub event_type: String,
    /// Event-specific payload.
    pub payload: serde_json::Value,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
}

impl NewOutboxRecord {
    /// Materialize a freshly inserted, pending record.
    #[must_use]
    pub fn into_pending(self, position: i64) -> OutboxRecord {
        OutboxRecord {
            id: self.id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            payload: self.payload,
            occurred_at: self.occurred_at,
            position,
            published_at: None,
            dead_lettered_at: None,
            dead_letter_topic: None,
            retry_count: 0,
            next_attempt_at: None,
            locked_at: None,
            locked_by: None,
            error: None,
        }
    }
}

/// The aggregate state document written by an atomic append.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    /// Aggregate type (e.g. `"Order"`).
    pub aggregate_type: String,
    /// Aggregate id.
    pub aggregate_id: String,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// Write timestamp.
    pub updated_at: DateTime<Utc>,
}

/// All writes of one `save_with_outbox` call. Applied entirely or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicWrite {
    /// The aggregate's new state.
    pub state: StateRow,
    /// One record per pending event, in buffer order.
    pub records: Vec<NewOutboxRecord>,
}

/// Parameters of a claim step.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity written into `locked_by`.
    pub worker_id: String,
    /// Maximum number of records to lease.
    pub batch_size: usize,
    /// Leases older than this are considered abandoned.
    pub stale_after: Duration,
    /// Claim time, written into `locked_at`.
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    /// Leases taken before this instant are stale.
    #[must_use]
    pub fn stale_before(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|window| self.now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// How a claimed record's attempt concluded. Every variant releases the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Publish acknowledged by the broker.
    Published,

    /// Publish failed; the record returns to the pool later.
    Retry {
        /// Earliest next claim.
        next_attempt_at: DateTime<Utc>,
        /// Failure message.
        error: String,
    },

    /// The record reached a dead-letter sink.
    DeadLettered {
        /// The sink that acknowledged it.
        topic: String,
        /// Why it was quarantined.
        error: String,
        /// Whether this conclusion followed a failed business publish (counts as a retry).
        failed_attempt: bool,
    },

    /// Not attempted because an earlier record of the same aggregate failed in this batch.
    Deferred {
        /// Earliest next claim (the blocking record's retry time).
        next_attempt_at: DateTime<Utc>,
    },
}

/// A per-record outcome ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    /// The record.
    pub id: Uuid,
    /// How the attempt ended.
    pub outcome: RecordOutcome,
    /// When the outcome was decided.
    pub resolved_at: DateTime<Utc>,
}

/// Apply a resolution to a record in memory.
///
/// Shared by stores that keep records as plain values; the SQL store expresses
/// the same transitions as `UPDATE` statements.
pub fn apply_resolution(record: &mut OutboxRecord, resolved: &ResolvedRecord) {
    match &resolved.outcome {
        RecordOutcome::Published => {
            record.published_at = Some(resolved.resolved_at);
            record.error = None;
        },
        RecordOutcome::Retry {
            next_attempt_at,
            error,
        } => {
            record.retry_count += 1;
            record.next_attempt_at = Some(*next_attempt_at);
            record.error = Some(error.clone());
        },
        RecordOutcome::DeadLettered {
            topic,
            error,
            failed_attempt,
        } => {
            if *failed_attempt {
                record.retry_count += 1;
            }
            record.dead_lettered_at = Some(resolved.resolved_at);
            record.published_at = Some(resolved.resolved_at);
            record.dead_letter_topic = Some(topic.clone());
            record.error = Some(error.clone());
        },
        RecordOutcome::Deferred { next_attempt_at } => {
            record.next_attempt_at = Some(*next_attempt_at);
        },
    }
    record.locked_at = None;
    record.locked_by = None;
}

/// Transactional store for aggregate state and outbox records.
///
/// # Guarantees required from implementations
///
/// - [`commit`](OutboxStore::commit) is all-or-nothing.
/// - [`claim_batch`](OutboxStore::claim_batch) never hands the same non-stale
///   record to two workers, and never hands out a record that an earlier record
///   of its aggregate [holds back](OutboxRecord::holds_back).
/// - [`resolve`](OutboxStore::resolve) persists a whole batch in one transaction,
///   and only touches rows still leased by the resolving worker.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the relay can hold an
/// `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Persist the aggregate state and its outbox records as one unit.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if any write fails; nothing is visible then.
    fn commit(
        &self,
        write: AtomicWrite,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Load the latest state document of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>, OutboxError>> + Send + '_>>;

    /// Atomically lease up to `batch_size` claimable records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the claim transaction fails.
    fn claim_batch(
        &self,
        request: ClaimRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>>;

    /// Persist the outcomes of a batch in one transaction.
    ///
    /// Returns how many records were updated. Records no longer leased by
    /// `worker_id` are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the transaction fails; no outcome is
    /// persisted then and the leases expire through the staleness window.
    fn resolve(
        &self,
        worker_id: &str,
        outcomes: Vec<ResolvedRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, OutboxError>> + Send + '_>>;

    /// Fetch a single record.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn get(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxRecord>, OutboxError>> + Send + '_>>;

    /// Non-terminal records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn list_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap_or_default()
    }

    fn pending_record() -> OutboxRecord {
        NewOutboxRecord {
            id: Uuid::new_v4(),
            aggregate_id: "order-1".into(),
            aggregate_type: "Order".into(),
            event_type: "OrderCreatedEvent".into(),
            payload: serde_json::json!({ "orderId": "order-1", "customerId": "c-1" }),
            occurred_at: at(0),
        }
        .into_pending(1)
    }

    #[test]
    fn envelope_merges_payload_after_envelope_fields() {
        let record = pending_record();
        let envelope = record.envelope();

        assert_eq!(envelope["eventId"], record.id.to_string());
        assert_eq!(envelope["aggregateId"], "order-1");
        assert_eq!(envelope["eventType"], "OrderCreatedEvent");
        assert_eq!(envelope["customerId"], "c-1");
        assert!(envelope["occurredAt"].as_str().is_some_and(|s| s.ends_with('Z')));
    }

    #[test]
    fn claimability_respects_backoff_and_leases() {
        let mut record = pending_record();
        let now = at(100);
        let stale_before = at(40);
        assert!(record.is_claimable(now, stale_before));

        record.next_attempt_at = Some(at(101));
        assert!(!record.is_claimable(now, stale_before));

        record.next_attempt_at = Some(at(100));
        record.locked_at = Some(at(50));
        assert!(!record.is_claimable(now, stale_before), "fresh lease");

        record.locked_at = Some(at(39));
        assert!(record.is_claimable(now, stale_before), "stale lease");

        record.published_at = Some(at(60));
        assert!(!record.is_claimable(now, stale_before), "terminal");
    }

    #[test]
    fn unfinished_earlier_records_hold_back_their_aggregate() {
        let first = pending_record();
        let mut second = pending_record();
        second.position = 2;
        let now = at(100);
        let stale_before = at(40);

        assert!(first.precedes(&second));
        assert!(!second.precedes(&first));
        assert!(!first.holds_back(&second, now, stale_before), "claimable together");

        let mut backing_off = first.clone();
        backing_off.next_attempt_at = Some(at(101));
        assert!(backing_off.holds_back(&second, now, stale_before));

        let mut leased = first.clone();
        leased.locked_at = Some(at(90));
        assert!(leased.holds_back(&second, now, stale_before));

        let mut other_aggregate = backing_off.clone();
        other_aggregate.aggregate_id = "order-2".into();
        assert!(!other_aggregate.holds_back(&second, now, stale_before));

        let mut delivered = backing_off;
        delivered.published_at = Some(at(95));
        assert!(!delivered.holds_back(&second, now, stale_before));
    }

    #[test]
    fn every_resolution_releases_the_lease() {
        let outcomes = [
            RecordOutcome::Published,
            RecordOutcome::Retry {
                next_attempt_at: at(10),
                error: "broker down".into(),
            },
            RecordOutcome::DeadLettered {
                topic: "order.created.outbox.dlq".into(),
                error: "broker down".into(),
                failed_attempt: true,
            },
            RecordOutcome::Deferred {
                next_attempt_at: at(10),
            },
        ];

        for outcome in outcomes {
            let mut record = pending_record();
            record.locked_at = Some(at(1));
            record.locked_by = Some("worker-a".into());
            let id = record.id;
            apply_resolution(
                &mut record,
                &ResolvedRecord {
                    id,
                    outcome,
                    resolved_at: at(2),
                },
            );
            assert!(record.locked_at.is_none());
            assert!(record.locked_by.is_none());
        }
    }

    #[test]
    fn dead_lettered_status_takes_precedence() {
        let mut record = pending_record();
        let id = record.id;
        apply_resolution(
            &mut record,
            &ResolvedRecord {
                id,
                outcome: RecordOutcome::DeadLettered {
                    topic: "outbox.unknown-topic".into(),
                    error: "No topic mapping".into(),
                    failed_attempt: false,
                },
                resolved_at: at(5),
            },
        );
        assert_eq!(record.status(), OutboxStatus::DeadLettered);
        assert!(record.published_at.is_some());
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn stale_before_saturates_for_huge_windows() {
        let request = ClaimRequest {
            worker_id: "w".into(),
            batch_size: 1,
            stale_after: Duration::from_secs(u64::MAX),
            now: at(0),
        };
        assert_eq!(request.stale_before(), DateTime::<Utc>::MIN_UTC);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn terminal_records_are_never_claimable(
                published in any::<bool>(),
                dead in any::<bool>(),
                now in 0i64..1_000,
            ) {
                prop_assume!(published || dead);
                let mut record = pending_record();
                record.published_at = published.then(|| at(0));
                record.dead_lettered_at = dead.then(|| at(0));

                prop_assert!(record.status().is_terminal());
                prop_assert!(!record.is_claimable(at(now), at(now)));
            }

            #[test]
            fn payload_fields_survive_the_envelope(key in "[a-z]{1,12}", value in any::<i64>()) {
                let mut record = pending_record();
                record.payload = serde_json::json!({ key.clone(): value });

                let envelope = record.envelope();
                prop_assert_eq!(&envelope[key.as_str()], &serde_json::json!(value));
                prop_assert_eq!(&envelope["aggregateId"], "order-1");
            }
        }
    }
}
