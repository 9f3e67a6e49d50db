//! # Outbox Runtime
//!
//! The moving parts of reliable event delivery.
//!
//! This crate provides the two long-running loops built on the `outbox-core`
//! abstractions, plus their ambient concerns.
//!
//! ## Core Components
//!
//! - **Outbox relay**: claims outbox records, publishes them and resolves each outcome
//! - **Consumer runtime**: validates and handles messages of one subscription with
//!   bounded retries and a dead-letter topic
//! - **Retry**: exponential backoff with jitter shared by both loops
//! - **Configuration**: environment-driven settings for relay, broker and database
//! - **Metrics**: Prometheus counters and histograms
//!
//! ## Example
//!
//! ```ignore
//! use outbox_runtime::{config::Config, relay::OutboxRelay};
//!
//! let config = Config::from_env()?;
//! let relay = OutboxRelay::new(store, producer, clock, config.relay);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! relay.run(shutdown_rx).await;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Environment-driven configuration
pub mod config;

/// Outbox relay worker
pub mod relay;

/// Consumer runtime with retries and dead-lettering
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

pub use config::{Config, ConfigError, KafkaConfig, RelayConfig};
pub use consumer::{
    ConsumerError, ConsumerRuntime, DeadLetterReason, HandlerError, MessageContext,
    MessageHandler, MessageOutcome,
};
pub use relay::{CycleReport, OutboxRelay, RelayError};
pub use retry::RetryPolicy;
