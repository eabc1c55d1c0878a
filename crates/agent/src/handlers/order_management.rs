use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{
    contains_any, Handler, HandlerAction, HandlerFailure, HandlerKind, HandlerRequest,
    HandlerResponse,
};
use crate::collaborators::{Order, OrderLookup, OrderStatus};

const REFUND_TERMS: &[&str] = &["refund", "money back", "reimburse", "charge back my"];

/// Looks up the referenced order and reports on it. Refund requests on eligible orders
/// carry an [`HandlerAction::IssueRefund`] for the caller to execute.
pub struct OrderManagementHandler {
    orders: Arc<dyn OrderLookup>,
}

impl OrderManagementHandler {
    pub fn new(orders: Arc<dyn OrderLookup>) -> Self {
        Self { orders }
    }
}

/// First token that looks like an order number: at least three digits, optionally
/// prefixed with `#` or an alphanumeric code such as `ORD-1042`.
pub fn extract_order_reference(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| {
            token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-').trim_matches('-')
        })
        .find(|token| {
            token.chars().filter(char::is_ascii_digit).count() >= 3
                && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
        .map(str::to_string)
}

fn describe(order: &Order) -> String {
    match order.status {
        OrderStatus::Processing => {
            format!("Order #{} ({}) is still being processed.", order.id, order.summary)
        }
        OrderStatus::Shipped => match &order.tracking_number {
            Some(tracking) => format!(
                "Order #{} ({}) has shipped. Your tracking number is {tracking}.",
                order.id, order.summary
            ),
            None => format!("Order #{} ({}) has shipped.", order.id, order.summary),
        },
        OrderStatus::Delivered => {
            format!("Order #{} ({}) has been delivered.", order.id, order.summary)
        }
        OrderStatus::Cancelled => {
            format!("Order #{} ({}) was cancelled.", order.id, order.summary)
        }
    }
}

#[async_trait]
impl Handler for OrderManagementHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::OrderManagement
    }

    async fn respond(
        &self,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        let Some(reference) = extract_order_reference(request.text) else {
            return Ok(HandlerResponse::text(
                "I can help with that. What is your order number? You can find it in your \
                 confirmation email.",
            ));
        };

        let Some(order) = self.orders.find_order(&reference).await? else {
            debug!(event_name = "handler.order_not_found", order_id = %reference, "unknown order");
            return Ok(HandlerResponse::text(format!(
                "I could not find an order with the number {reference}. Could you double-check \
                 it?"
            )));
        };

        let status = describe(&order);
        let wants_refund = contains_any(&request.text.to_lowercase(), REFUND_TERMS);
        if !wants_refund {
            return Ok(HandlerResponse::text(status));
        }

        if order.refundable && order.status != OrderStatus::Cancelled {
            Ok(HandlerResponse::text(format!(
                "{status} I have started a refund for this order. You will receive a \
                 confirmation email shortly."
            ))
            .with_action(HandlerAction::IssueRefund { order_id: order.id }))
        } else {
            Ok(HandlerResponse::text(format!(
                "{status} This order is not eligible for an automatic refund."
            )))
        }
    }
}
