//! Domain events and the per-aggregate event buffer.
//!
//! Events describe facts that happened to an aggregate. They are raised during
//! a state transition, held in the aggregate's [`EventBuffer`] and handed to the
//! outbox in the same transaction that persists the new state.
//!
//! # Example
//!
//! ```
//! use outbox_core::event::{Event, EventBuffer, DomainEvent};
//! use serde::{Serialize, Deserialize};
//! use chrono::Utc;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! #[serde(untagged)]
//! enum AccountEvent {
//!     Opened { owner: String },
//! }
//!
//! impl Event for AccountEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             AccountEvent::Opened { .. } => "AccountOpenedEvent",
//!         }
//!     }
//! }
//!
//! let mut buffer = EventBuffer::default();
//! buffer.record(DomainEvent::new("acc-1", AccountEvent::Opened { owner: "ada".into() }, Utc::now()));
//! assert_eq!(buffer.len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to turn the event into its JSON payload.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// The payload of an event must be a JSON object so it can be merged into the envelope.
    #[error("Event payload for '{0}' is not a JSON object")]
    PayloadNotObject(String),
}

/// A domain event variant.
///
/// Implementations are usually enums, one variant per event type, serialized
/// with `#[serde(untagged)]` so the payload carries only the variant's fields.
/// The variant tag travels separately as [`Event::event_type`].
pub trait Event: Send + Sync + 'static {
    /// Stable event type identifier (e.g. `"OrderCreatedEvent"`).
    ///
    /// Combined with the aggregate type it selects the destination topic.
    fn event_type(&self) -> &'static str;

    /// Event-specific payload as a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be serialized,
    /// or [`EventError::PayloadNotObject`] if it does not serialize to a JSON object.
    fn payload(&self) -> Result<serde_json::Value, EventError>
    where
        Self: Serialize,
    {
        let value = serde_json::to_value(self)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;
        if value.is_object() {
            Ok(value)
        } else {
            Err(EventError::PayloadNotObject(self.event_type().to_string()))
        }
    }
}

/// An immutable event raised by an aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainEvent<E> {
    /// Unique event id. Also used as the outbox record id.
    pub event_id: Uuid,

    /// The aggregate that raised the event. Used as the partition key.
    pub aggregate_id: String,

    /// When the event happened.
    pub occurred_at: DateTime<Utc>,

    /// The event variant with its payload.
    pub event: E,
}

impl<E: Event> DomainEvent<E> {
    /// Create a new event with a fresh id.
    #[must_use]
    pub fn new(aggregate_id: impl Into<String>, event: E, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            occurred_at,
            event,
        }
    }

    /// The event type tag of the wrapped variant.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Ordered buffer of events raised during a single business operation.
///
/// Owned by exactly one aggregate instance. Insertion order is delivery order.
/// The buffer is cleared only after the events have been durably handed to the
/// outbox, never before.
#[derive(Clone, Debug)]
pub struct EventBuffer<E> {
    events: Vec<DomainEvent<E>>,
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> EventBuffer<E> {
    /// Append an event.
    pub fn record(&mut self, event: DomainEvent<E>) {
        self.events.push(event);
    }

    /// Events raised since the last successful save, in insertion order.
    #[must_use]
    pub fn pending(&self) -> &[DomainEvent<E>] {
        &self.events
    }

    /// Forget all pending events.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether there is nothing left to hand off.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(untagged)]
    enum TestEvent {
        Created { id: String, value: i32 },
        Renamed(String),
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "TestCreatedEvent",
                TestEvent::Renamed(_) => "TestRenamedEvent",
            }
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn payload_contains_only_variant_fields() {
        let event = TestEvent::Created {
            id: "t-1".to_string(),
            value: 42,
        };
        let payload = event.payload().expect("payload should serialize");
        assert_eq!(payload, serde_json::json!({ "id": "t-1", "value": 42 }));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let event = TestEvent::Renamed("new-name".to_string());
        assert!(matches!(
            event.payload(),
            Err(EventError::PayloadNotObject(t)) if t == "TestRenamedEvent"
        ));
    }

    #[test]
    fn buffer_preserves_insertion_order() {
        let mut buffer = EventBuffer::default();
        for value in 0..3 {
            buffer.record(DomainEvent::new(
                "agg-1",
                TestEvent::Created {
                    id: "t-1".to_string(),
                    value,
                },
                Utc::now(),
            ));
        }

        let values: Vec<i32> = buffer
            .pending()
            .iter()
            .filter_map(|e| match e.event {
                TestEvent::Created { value, .. } => Some(value),
                TestEvent::Renamed(_) => None,
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2]);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn every_event_gets_a_fresh_id() {
        let a = DomainEvent::new("agg-1", TestEvent::Renamed("a".into()), Utc::now());
        let b = DomainEvent::new("agg-1", TestEvent::Renamed("a".into()), Utc::now());
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_type(), "TestRenamedEvent");
    }
}
