//! Per-topic message validation.
//!
//! A topic may have a schema registered; a topic without one only gets the JSON
//! well-formedness check done by the consumer runtime. Schemas are typed
//! contracts: a message is valid when it deserializes into the contract struct
//! and passes the contract's own checks. Unknown fields are tolerated so
//! producers can add fields without breaking consumers.
//!
//! # Example
//!
//! ```
//! use outbox_core::schema::{Contract, SchemaRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Ping {
//!     seq: u64,
//! }
//!
//! impl Contract for Ping {}
//!
//! let registry = SchemaRegistry::new().register::<Ping>("ping.sent");
//! assert!(registry.validate("ping.sent", &serde_json::json!({ "seq": 1 })).is_ok());
//! assert!(registry.validate("ping.sent", &serde_json::json!({ "seq": "one" })).is_err());
//! assert!(registry.validate("pong.sent", &serde_json::json!("anything")).is_ok());
//! ```

pub mod contracts;

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// A message did not satisfy its topic's schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SchemaViolation(pub String);

/// Validator for the messages of one topic.
pub trait MessageSchema: Send + Sync {
    /// Check a parsed message.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaViolation`] describing the first problem found.
    fn validate(&self, message: &serde_json::Value) -> Result<(), SchemaViolation>;
}

/// A typed message contract.
pub trait Contract: DeserializeOwned + Send + Sync + 'static {
    /// Rules that deserialization alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated rule.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// [`MessageSchema`] backed by a [`Contract`] type.
pub struct TypedSchema<T> {
    _contract: PhantomData<fn() -> T>,
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self {
            _contract: PhantomData,
        }
    }
}

impl<T: Contract> MessageSchema for TypedSchema<T> {
    fn validate(&self, message: &serde_json::Value) -> Result<(), SchemaViolation> {
        let contract = T::deserialize(message).map_err(|e| SchemaViolation(e.to_string()))?;
        contract.check().map_err(SchemaViolation)
    }
}

/// Schemas keyed by topic name.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn MessageSchema>>,
}

impl SchemaRegistry {
    /// An empty registry: no topic is validated beyond JSON well-formedness.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed contract for `topic`.
    #[must_use]
    pub fn register<T: Contract>(self, topic: impl Into<String>) -> Self {
        self.register_schema(topic, Arc::new(TypedSchema::<T>::default()))
    }

    /// Register any schema implementation for `topic`.
    #[must_use]
    pub fn register_schema(
        mut self,
        topic: impl Into<String>,
        schema: Arc<dyn MessageSchema>,
    ) -> Self {
        self.schemas.insert(topic.into(), schema);
        self
    }

    /// Whether `topic` has a schema.
    #[must_use]
    pub fn has_schema(&self, topic: &str) -> bool {
        self.schemas.contains_key(topic)
    }

    /// Validate `message` against the schema of `topic`, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaViolation`] if a schema is registered and rejects the message.
    pub fn validate(&self, topic: &str, message: &serde_json::Value) -> Result<(), SchemaViolation> {
        match self.schemas.get(topic) {
            Some(schema) => schema.validate(message),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        topics.sort_unstable();
        f.debug_struct("SchemaRegistry").field("topics", &topics).finish()
    }
}

/// Registry with the contracts of every business topic.
#[must_use]
pub fn default_schemas() -> SchemaRegistry {
    use contracts::{
        BaseEnvelope, OrderCancelled, OrderConfirmed, OrderCreated, PaymentProcessed,
    };

    SchemaRegistry::new()
        .register::<OrderCreated>("order.created")
        .register::<OrderConfirmed>("order.confirmed")
        .register::<OrderCancelled>("order.cancelled")
        .register::<BaseEnvelope>("order.delivered")
        .register::<PaymentProcessed>("payment.processed")
        .register::<BaseEnvelope>("notification.sent")
}
