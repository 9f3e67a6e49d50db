//! Downstream handlers of the order service.

use crate::order::{Order, OrderStatus};
use async_trait::async_trait;
use outbox_core::environment::Clock;
use outbox_core::repository::OutboxRepository;
use outbox_runtime::consumer::{HandlerError, MessageContext, MessageHandler};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum PaymentStatus {
    Success,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentProcessed {
    event_id: String,
    order_id: String,
    #[serde(default)]
    payment_id: Option<String>,
    #[serde(default)]
    status: Option<PaymentStatus>,
    #[serde(default)]
    reason: Option<String>,
}

/// Confirms or cancels an order when its payment outcome arrives on
/// `payment.processed`.
///
/// The transition and its new order event are persisted with
/// [`OutboxRepository::save_with_outbox`], so the confirmation reaches
/// `order.confirmed` through the relay. Redelivered payments for an order that
/// already left `PENDING` are acknowledged without a second transition.
pub struct PaymentProcessedHandler {
    repository: OutboxRepository,
    clock: Arc<dyn Clock>,
}

impl PaymentProcessedHandler {
    /// Create a handler persisting through `repository`.
    #[must_use]
    pub fn new(repository: OutboxRepository, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }
}

#[async_trait]
impl MessageHandler for PaymentProcessedHandler {
    async fn handle(
        &self,
        message: &serde_json::Value,
        context: &MessageContext,
    ) -> Result<(), HandlerError> {
        let payment: PaymentProcessed = serde_json::from_value(message.clone())
            .map_err(|e| HandlerError::new(format!("unreadable payment: {e}")))?;

        let Some(mut order) = self.repository.load::<Order>(&payment.order_id).await? else {
            tracing::warn!(order_id = %payment.order_id, event_id = %payment.event_id, "Order not found");
            return Ok(());
        };

        if order.status() != OrderStatus::Pending {
            tracing::info!(
                order_id = %payment.order_id,
                event_id = %payment.event_id,
                status = %order.status(),
                "Payment already applied, skipping"
            );
            return Ok(());
        }

        let now = self.clock.now();
        if payment.status == Some(PaymentStatus::Failed) {
            let reason = payment.reason.as_deref().unwrap_or("unknown");
            order
                .cancel(format!("Payment failed: {reason}"), now)
                .map_err(HandlerError::new)?;
            self.repository.save_with_outbox(&mut order).await?;
            tracing::warn!(
                order_id = %payment.order_id,
                attempt = context.attempt,
                "Order cancelled, payment failed"
            );
        } else {
            order.confirm(now).map_err(HandlerError::new)?;
            self.repository.save_with_outbox(&mut order).await?;
            tracing::info!(
                order_id = %payment.order_id,
                payment_id = payment.payment_id.as_deref().unwrap_or("-"),
                attempt = context.attempt,
                "Order confirmed after payment"
            );
        }
        Ok(())
    }
}
