//! # Outbox Core
//!
//! Core traits and types for reliable event delivery with the transactional
//! outbox pattern.
//!
//! This crate holds everything that does not depend on a concrete database or
//! broker: the event model, the outbox record lifecycle, the store and broker
//! abstractions, topic routing and per-topic schema validation.
//!
//! ## Core Concepts
//!
//! - **Event buffer**: an aggregate records domain events while it changes state
//! - **Atomic save**: state and one outbox record per event commit together
//! - **Relay**: workers lease outbox records and publish them to their topics
//! - **Consumer**: handlers process topic messages with retries and a dead-letter topic
//!
//! ## Delivery Guarantees
//!
//! - At-least-once end to end; consumers deduplicate by `eventId`
//! - Per-aggregate order, since the aggregate id is the partition key
//! - Nothing is published for a save that did not commit
//!
//! ## Example
//!
//! ```ignore
//! use outbox_core::repository::OutboxRepository;
//!
//! let repository = OutboxRepository::new(store, clock);
//! let mut order = Order::place("customer-1", items, clock.now())?;
//! repository.save_with_outbox(&mut order).await?;
//! assert!(order.events().is_empty());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod broker;
pub mod event;
pub mod outbox;
pub mod repository;
pub mod routing;
pub mod schema;

pub use broker::{BrokerError, EventProducer, InboundMessage, MessageSource};
pub use event::{DomainEvent, Event, EventBuffer, EventError};
pub use outbox::{
    ClaimRequest, OutboxError, OutboxRecord, OutboxStatus, OutboxStore, RecordOutcome,
    ResolvedRecord,
};
pub use repository::{Aggregate, OutboxRepository, RepositoryError};
pub use routing::TopicRouter;
pub use schema::{SchemaRegistry, SchemaViolation};

/// Environment module - Dependency injection traits
///
/// External dependencies of the core (currently only time) are abstracted
/// behind traits so tests can control them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use outbox_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
