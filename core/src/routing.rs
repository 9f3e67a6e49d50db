//! Topic routing and dead-letter naming.
//!
//! Business topics are named `<entity>.<pastTenseEvent>` (`order.created`,
//! `payment.processed`). The relay selects one from a static table keyed by
//! `"<aggregateType>.<eventType>"`; a key missing from the table can never be
//! routed and goes to [`UNKNOWN_TOPIC_SINK`] instead.

use std::collections::HashMap;

/// Sink for outbox records whose routing key has no topic.
pub const UNKNOWN_TOPIC_SINK: &str = "outbox.unknown-topic";

/// Consumer-side dead-letter topic: `<topic>.dlq`.
#[must_use]
pub fn consumer_dlq_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// Relay-side dead-letter topic: `<topic>.outbox.dlq`.
#[must_use]
pub fn outbox_dlq_topic(topic: &str) -> String {
    format!("{topic}.outbox.dlq")
}

/// Static map from `"<aggregateType>.<eventType>"` to a business topic.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    routes: HashMap<String, String>,
}

impl TopicRouter {
    /// An empty table: every record is unroutable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route.
    #[must_use]
    pub fn route(
        mut self,
        aggregate_type: &str,
        event_type: &str,
        topic: impl Into<String>,
    ) -> Self {
        self.routes
            .insert(format!("{aggregate_type}.{event_type}"), topic.into());
        self
    }

    /// Look up the destination topic of a routing key.
    #[must_use]
    pub fn topic_for(&self, routing_key: &str) -> Option<&str> {
        self.routes.get(routing_key).map(String::as_str)
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The routes of the order, payment and notification services.
#[must_use]
pub fn default_routes() -> TopicRouter {
    TopicRouter::new()
        .route("Order", "OrderCreatedEvent", "order.created")
        .route("Order", "OrderConfirmedEvent", "order.confirmed")
        .route("Order", "OrderCancelledEvent", "order.cancelled")
        .route("Order", "OrderDeliveredEvent", "order.delivered")
        .route("Payment", "PaymentProcessedEvent", "payment.processed")
        .route("Notification", "NotificationSentEvent", "notification.sent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_routes_known_events() {
        let router = default_routes();
        assert_eq!(router.topic_for("Order.OrderCreatedEvent"), Some("order.created"));
        assert_eq!(
            router.topic_for("Payment.PaymentProcessedEvent"),
            Some("payment.processed")
        );
        assert_eq!(router.topic_for("Order.OrderShippedEvent"), None);
        assert_eq!(router.topic_for("Payment.OrderCreatedEvent"), None);
    }

    #[test]
    fn dead_letter_topic_names() {
        assert_eq!(consumer_dlq_topic("order.created"), "order.created.dlq");
        assert_eq!(outbox_dlq_topic("order.created"), "order.created.outbox.dlq");
    }
}
