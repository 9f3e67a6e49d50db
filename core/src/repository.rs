//! Aggregates and the atomic state + outbox append.
//!
//! [`OutboxRepository::save_with_outbox`] is the seam that makes "business logic
//! ran" and "event durably queued" the same transaction. On success both the
//! state row and every outbox record exist and the aggregate's buffer is empty.
//! On failure nothing is visible and the buffer is left untouched, so the caller
//! can retry the whole operation.

use crate::environment::Clock;
use crate::event::{Event, EventBuffer, EventError};
use crate::outbox::{AtomicWrite, NewOutboxRecord, OutboxError, OutboxStore, StateRow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

/// Errors from repository operations.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] OutboxError),

    /// An event payload could not be built.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Aggregate state could not be (de)serialized.
    #[error("State serialization error: {0}")]
    State(String),
}

/// An aggregate that records events as a side effect of its state transitions.
///
/// The buffer is embedded by composition and must be excluded from the
/// persisted state (`#[serde(skip)]`).
pub trait Aggregate: Serialize + DeserializeOwned + Send {
    /// Event sum type raised by this aggregate.
    type Event: Event + Serialize;

    /// Aggregate type name, first half of the routing key (e.g. `"Order"`).
    const AGGREGATE_TYPE: &'static str;

    /// Identity of this instance.
    fn aggregate_id(&self) -> String;

    /// Events raised since the last successful save.
    fn events(&self) -> &EventBuffer<Self::Event>;

    /// Mutable access for recording and clearing.
    fn events_mut(&mut self) -> &mut EventBuffer<Self::Event>;
}

/// Persists aggregates together with their outbox records.
#[derive(Clone)]
pub struct OutboxRepository {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
}

impl OutboxRepository {
    /// Create a repository over a transactional store.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Persist the aggregate's state and one outbox record per pending event,
    /// then clear its buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if building the write or committing it fails.
    /// The buffer still holds every pending event in that case.
    pub async fn save_with_outbox<A: Aggregate>(
        &self,
        aggregate: &mut A,
    ) -> Result<(), RepositoryError> {
        let write = Self::build_write(aggregate, self.clock.now())?;
        let event_count = write.records.len();

        self.store.commit(write).await?;
        aggregate.events_mut().clear();

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %aggregate.aggregate_id(),
            events = event_count,
            "Aggregate saved with outbox records"
        );
        Ok(())
    }

    /// Load an aggregate by id. The returned instance has an empty buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the query fails or the state does not deserialize.
    pub async fn load<A: Aggregate>(&self, aggregate_id: &str) -> Result<Option<A>, RepositoryError> {
        let Some(state) = self.store.load_state(A::AGGREGATE_TYPE, aggregate_id).await? else {
            return Ok(None);
        };
        serde_json::from_value(state)
            .map(Some)
            .map_err(|e| RepositoryError::State(e.to_string()))
    }

    fn build_write<A: Aggregate>(
        aggregate: &A,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<AtomicWrite, RepositoryError> {
        let state =
            serde_json::to_value(&*aggregate).map_err(|e| RepositoryError::State(e.to_string()))?;

        let records = aggregate
            .events()
            .pending()
            .iter()
            .map(|pending| {
                Ok(NewOutboxRecord {
                    id: pending.event_id,
                    aggregate_id: pending.aggregate_id.clone(),
                    aggregate_type: A::AGGREGATE_TYPE.to_string(),
                    event_type: pending.event_type().to_string(),
                    payload: pending.event.payload()?,
                    occurred_at: pending.occurred_at,
                })
            })
            .collect::<Result<Vec<_>, EventError>>()?;

        Ok(AtomicWrite {
            state: StateRow {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                aggregate_id: aggregate.aggregate_id(),
                state,
                updated_at: now,
            },
            records,
        })
    }
}
