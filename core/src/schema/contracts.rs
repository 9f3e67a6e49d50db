//! Message contracts of the business topics.

use super::Contract;
use serde::Deserialize;

/// Fields every relayed event carries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEnvelope {
    /// Event id.
    pub event_id: String,
    /// Event type tag.
    pub event_type: String,
    /// Aggregate id.
    pub aggregate_id: String,
    /// ISO-8601 timestamp.
    pub occurred_at: String,
}

impl Contract for BaseEnvelope {
    fn check(&self) -> Result<(), String> {
        for (field, value) in [
            ("eventId", &self.event_id),
            ("eventType", &self.event_type),
            ("aggregateId", &self.aggregate_id),
        ] {
            if value.is_empty() {
                return Err(format!("{field} must not be empty"));
            }
        }
        if self.occurred_at.chars().count() < 10 {
            return Err(format!("occurredAt '{}' is not a timestamp", self.occurred_at));
        }
        Ok(())
    }
}

/// Amount with an ISO-4217 currency code.
#[derive(Debug, Clone, Deserialize)]
pub struct Money {
    /// Amount in major units.
    pub amount: f64,
    /// Three-letter currency code.
    pub currency: String,
}

fn check_currency(currency: &str) -> Result<(), String> {
    if currency.chars().count() == 3 {
        Ok(())
    } else {
        Err(format!("currency '{currency}' must have 3 characters"))
    }
}

impl Money {
    fn check(&self) -> Result<(), String> {
        check_currency(&self.currency)
    }
}

/// One line of an order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Product id.
    pub product_id: String,
    /// Positive quantity.
    pub quantity: u64,
    /// Price per unit.
    pub unit_price: Money,
}

/// `order.created`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// Envelope fields.
    #[serde(flatten)]
    pub envelope: BaseEnvelope,
    /// Ordering customer.
    pub customer_id: Option<String>,
    /// Order total.
    pub total: Option<Money>,
    /// Ordered lines.
    pub items: Option<Vec<LineItem>>,
}

impl Contract for OrderCreated {
    fn check(&self) -> Result<(), String> {
        self.envelope.check()?;
        if let Some(total) = &self.total {
            total.check()?;
        }
        for item in self.items.iter().flatten() {
            if item.quantity == 0 {
                return Err(format!("quantity of {} must be positive", item.product_id));
            }
            item.unit_price.check()?;
        }
        Ok(())
    }
}

/// `order.confirmed`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    /// Envelope fields.
    #[serde(flatten)]
    pub envelope: BaseEnvelope,
    /// Confirmed order.
    pub order_id: Option<String>,
    /// Ordering customer.
    pub customer_id: Option<String>,
    /// Order total.
    pub total: Option<Money>,
}

impl Contract for OrderConfirmed {
    fn check(&self) -> Result<(), String> {
        self.envelope.check()?;
        self.total.as_ref().map_or(Ok(()), Money::check)
    }
}

/// `order.cancelled`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    /// Envelope fields.
    #[serde(flatten)]
    pub envelope: BaseEnvelope,
    /// Cancelled order.
    pub order_id: Option<String>,
    /// Ordering customer.
    pub customer_id: Option<String>,
    /// Cancellation reason.
    pub reason: Option<String>,
}

impl Contract for OrderCancelled {
    fn check(&self) -> Result<(), String> {
        self.envelope.check()
    }
}

/// Outcome reported by the payment service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Charge captured.
    Success,
    /// Charge declined.
    Failed,
}

/// Payment amount: a bare number or a money object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PaymentAmount {
    /// Bare amount, currency carried separately.
    Value(f64),
    /// Amount with currency.
    Money(Money),
}

/// `payment.processed`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProcessed {
    /// Envelope fields.
    #[serde(flatten)]
    pub envelope: BaseEnvelope,
    /// Paid order.
    pub order_id: Option<String>,
    /// Payment outcome.
    pub status: Option<PaymentStatus>,
    /// Paid amount.
    pub amount: Option<PaymentAmount>,
    /// Currency of a bare amount.
    pub currency: Option<String>,
}

impl Contract for PaymentProcessed {
    fn check(&self) -> Result<(), String> {
        self.envelope.check()?;
        if let Some(PaymentAmount::Money(money)) = &self.amount {
            money.check()?;
        }
        self.currency.as_deref().map_or(Ok(()), check_currency)
    }
}

#[cfg(test)]
mod tests {
    use super::super::default_schemas;
    use serde_json::json;

    fn order_created(items: serde_json::Value) -> serde_json::Value {
        json!({
            "eventId": "e-1",
            "eventType": "OrderCreatedEvent",
            "aggregateId": "order-1",
            "occurredAt": "2025-01-01T00:00:00.000Z",
            "customerId": "c-1",
            "total": { "amount": 20.0, "currency": "USD" },
            "items": items,
            "extraField": true
        })
    }

    #[test]
    fn valid_order_created_passes_with_extra_fields() {
        let message = order_created(json!([
            { "productId": "p-1", "quantity": 2, "unitPrice": { "amount": 10.0, "currency": "USD" } }
        ]));
        assert!(default_schemas().validate("order.created", &message).is_ok());
    }

    #[test]
    fn zero_quantity_is_a_violation() {
        let message = order_created(json!([
            { "productId": "p-1", "quantity": 0, "unitPrice": { "amount": 10.0, "currency": "USD" } }
        ]));
        let violation = default_schemas()
            .validate("order.created", &message)
            .err()
            .map(|v| v.0);
        assert!(violation.is_some_and(|v| v.contains("p-1")));
    }

    #[test]
    fn missing_envelope_field_is_a_violation() {
        let message = json!({ "eventType": "OrderCreatedEvent", "aggregateId": "order-1" });
        assert!(default_schemas().validate("order.created", &message).is_err());
    }

    #[test]
    fn empty_event_id_is_a_violation() {
        let message = json!({
            "eventId": "",
            "eventType": "NotificationSentEvent",
            "aggregateId": "n-1",
            "occurredAt": "2025-01-01T00:00:00Z"
        });
        assert!(default_schemas().validate("notification.sent", &message).is_err());
    }

    #[test]
    fn payment_amount_accepts_number_or_money() {
        let registry = default_schemas();
        let base = |amount: serde_json::Value| {
            json!({
                "eventId": "e-2",
                "eventType": "PaymentProcessedEvent",
                "aggregateId": "pay-1",
                "occurredAt": "2025-01-01T00:00:00Z",
                "orderId": "order-1",
                "status": "SUCCESS",
                "amount": amount
            })
        };
        assert!(registry.validate("payment.processed", &base(json!(12.5))).is_ok());
        assert!(
            registry
                .validate("payment.processed", &base(json!({ "amount": 12.5, "currency": "EUR" })))
                .is_ok()
        );
        assert!(
            registry
                .validate("payment.processed", &base(json!({ "amount": 12.5, "currency": "EURO" })))
                .is_err()
        );
    }

    #[test]
    fn unknown_payment_status_is_a_violation() {
        let message = json!({
            "eventId": "e-2",
            "eventType": "PaymentProcessedEvent",
            "aggregateId": "pay-1",
            "occurredAt": "2025-01-01T00:00:00Z",
            "status": "PENDING"
        });
        assert!(default_schemas().validate("payment.processed", &message).is_err());
    }
}
