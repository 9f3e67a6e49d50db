//! The `Order` aggregate.
//!
//! Orders move `PENDING → CONFIRMED → DELIVERED`, and can be cancelled at any
//! point before delivery. Every transition records an [`OrderEvent`] in the
//! aggregate's buffer; nothing is published until the order is saved through
//! [`OutboxRepository::save_with_outbox`](outbox_core::repository::OutboxRepository::save_with_outbox).

use chrono::{DateTime, Utc};
use outbox_core::event::{DomainEvent, Event, EventBuffer};
use outbox_core::repository::Aggregate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Business rule violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// An order needs at least one line.
    #[error("Order must contain at least one item")]
    NoItems,

    /// A product may appear on one line only.
    #[error("Order cannot contain duplicate products: {0}")]
    DuplicateProduct(String),

    /// Quantities start at one.
    #[error("Quantity of {0} must be positive")]
    InvalidQuantity(String),

    /// All lines share the order's currency.
    #[error("Order mixes currencies {0} and {1}")]
    CurrencyMismatch(String, String),

    /// The transition is not allowed from the current status.
    #[error("Cannot {action} order in status {status}")]
    InvalidTransition {
        /// Attempted transition.
        action: &'static str,
        /// Current status.
        status: OrderStatus,
    },
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed, waiting for payment.
    Pending,
    /// Paid.
    Confirmed,
    /// Cancelled before delivery.
    Cancelled,
    /// Handed to the customer.
    Delivered,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Delivered => "DELIVERED",
        };
        f.write_str(name)
    }
}

/// An amount in a 3-letter currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in major units.
    pub amount: f64,
    /// ISO currency code.
    pub currency: String,
}

impl Money {
    /// Create an amount.
    pub fn new(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

/// One order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Product identifier.
    pub product_id: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
}

impl OrderItem {
    /// Create a line.
    pub fn new(product_id: impl Into<String>, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price,
        }
    }
}

/// Events raised by [`Order`]. The payload carries only the variant's fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OrderEvent {
    /// `OrderCreatedEvent`
    #[serde(rename_all = "camelCase")]
    Created {
        /// Order id.
        order_id: String,
        /// Customer id.
        customer_id: String,
        /// Lines.
        items: Vec<OrderItem>,
        /// Sum of all lines.
        total: Money,
    },
    /// `OrderConfirmedEvent`
    #[serde(rename_all = "camelCase")]
    Confirmed {
        /// Order id.
        order_id: String,
        /// Customer id.
        customer_id: String,
        /// Order total.
        total: Money,
    },
    /// `OrderCancelledEvent`
    #[serde(rename_all = "camelCase")]
    Cancelled {
        /// Order id.
        order_id: String,
        /// Customer id.
        customer_id: String,
        /// Why.
        reason: String,
    },
    /// `OrderDeliveredEvent`
    #[serde(rename_all = "camelCase")]
    Delivered {
        /// Order id.
        order_id: String,
        /// Customer id.
        customer_id: String,
    },
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "OrderCreatedEvent",
            Self::Confirmed { .. } => "OrderConfirmedEvent",
            Self::Cancelled { .. } => "OrderCancelledEvent",
            Self::Delivered { .. } => "OrderDeliveredEvent",
        }
    }
}

/// A customer order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: String,
    customer_id: String,
    status: OrderStatus,
    items: Vec<OrderItem>,
    total: Money,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: EventBuffer<OrderEvent>,
}

impl Order {
    /// Place a new order and record `OrderCreatedEvent`.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError`] if the lines are empty, repeat a product, have a
    /// zero quantity or mix currencies.
    pub fn place(
        customer_id: impl Into<String>,
        items: Vec<OrderItem>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        let total = Self::total_of(&items)?;
        let mut order = Self {
            id: Uuid::new_v4().to_string(),
            customer_id: customer_id.into(),
            status: OrderStatus::Pending,
            items,
            total,
            created_at: now,
            updated_at: now,
            events: EventBuffer::default(),
        };

        let event = OrderEvent::Created {
            order_id: order.id.clone(),
            customer_id: order.customer_id.clone(),
            items: order.items.clone(),
            total: order.total.clone(),
        };
        order.raise(event, now);
        Ok(order)
    }

    fn total_of(items: &[OrderItem]) -> Result<Money, OrderError> {
        let Some(first) = items.first() else {
            return Err(OrderError::NoItems);
        };

        let mut seen = HashSet::new();
        let mut amount = 0.0;
        for item in items {
            if !seen.insert(item.product_id.as_str()) {
                return Err(OrderError::DuplicateProduct(item.product_id.clone()));
            }
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity(item.product_id.clone()));
            }
            if item.unit_price.currency != first.unit_price.currency {
                return Err(OrderError::CurrencyMismatch(
                    first.unit_price.currency.clone(),
                    item.unit_price.currency.clone(),
                ));
            }
            amount += item.unit_price.amount * f64::from(item.quantity);
        }
        Ok(Money::new(amount, first.unit_price.currency.clone()))
    }

    /// Mark a pending order as paid.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::InvalidTransition`] unless the order is pending.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.guard(OrderStatus::Pending, "confirm")?;
        self.status = OrderStatus::Confirmed;
        let event = OrderEvent::Confirmed {
            order_id: self.id.clone(),
            customer_id: self.customer_id.clone(),
            total: self.total.clone(),
        };
        self.raise(event, now);
        Ok(())
    }

    /// Cancel an order that was not delivered.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::InvalidTransition`] if the order is delivered or
    /// already cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), OrderError> {
        if matches!(self.status, OrderStatus::Delivered | OrderStatus::Cancelled) {
            return Err(OrderError::InvalidTransition {
                action: "cancel",
                status: self.status,
            });
        }
        self.status = OrderStatus::Cancelled;
        let event = OrderEvent::Cancelled {
            order_id: self.id.clone(),
            customer_id: self.customer_id.clone(),
            reason: reason.into(),
        };
        self.raise(event, now);
        Ok(())
    }

    /// Hand a confirmed order to the customer.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::InvalidTransition`] unless the order is confirmed.
    pub fn deliver(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.guard(OrderStatus::Confirmed, "deliver")?;
        self.status = OrderStatus::Delivered;
        let event = OrderEvent::Delivered {
            order_id: self.id.clone(),
            customer_id: self.customer_id.clone(),
        };
        self.raise(event, now);
        Ok(())
    }

    fn guard(&self, expected: OrderStatus, action: &'static str) -> Result<(), OrderError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(OrderError::InvalidTransition {
                action,
                status: self.status,
            })
        }
    }

    fn raise(&mut self, event: OrderEvent, now: DateTime<Utc>) {
        self.updated_at = now;
        self.events.record(DomainEvent::new(self.id.clone(), event, now));
    }

    /// Order id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Customer id.
    #[must_use]
    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    /// Lines.
    #[must_use]
    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    /// Sum of all lines.
    #[must_use]
    pub const fn total(&self) -> &Money {
        &self.total
    }

    /// Time of the last transition.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Aggregate for Order {
    type Event = OrderEvent;

    const AGGREGATE_TYPE: &'static str = "Order";

    fn aggregate_id(&self) -> String {
        self.id.clone()
    }

    fn events(&self) -> &EventBuffer<OrderEvent> {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventBuffer<OrderEvent> {
        &mut self.events
    }
}
