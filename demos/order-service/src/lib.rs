//! # Order Service
//!
//! A small order domain wired to the outbox.
//!
//! [`Order`] records its lifecycle events while it changes state, and
//! [`PaymentProcessedHandler`] confirms orders as payments arrive. Both go
//! through [`OutboxRepository::save_with_outbox`](outbox_core::repository::OutboxRepository::save_with_outbox),
//! so an order transition and its event are committed together and the relay
//! publishes them afterwards.
//!
//! The crate ships two binaries:
//!
//! - `outbox-relay`: drains the outbox into Redpanda until Ctrl+C
//! - `payment-consumer`: consumes `payment.processed` with group `order-payment-processed`

pub mod handlers;
pub mod order;

pub use handlers::PaymentProcessedHandler;
pub use order::{Money, Order, OrderError, OrderEvent, OrderItem, OrderStatus};

/// Topic the payment consumer subscribes to.
pub const PAYMENT_TOPIC: &str = "payment.processed";

/// Consumer group of the payment consumer.
pub const PAYMENT_GROUP: &str = "order-payment-processed";
