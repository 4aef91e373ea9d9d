//! Outbox event model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Outbox event row, co-committed with the state change that produced it
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    /// Advisory idempotent-emission key; not enforced unique
    pub event_key: Option<String>,
    pub event_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Event types emitted by the core
pub mod event_type {
    pub const SUBSCRIPTION_CREATED: &str = "subscription.created";
    pub const SUBSCRIPTION_UPDATED: &str = "subscription.updated";
    pub const SUBSCRIPTION_PAUSED: &str = "subscription.paused";
    pub const SUBSCRIPTION_RESUMED: &str = "subscription.resumed";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription.canceled";
    pub const SUBSCRIPTION_RENEWED: &str = "subscription.renewed";
    pub const SUBSCRIPTION_PAYMENT_EXHAUSTED: &str = "subscription.payment_exhausted";

    pub const INVOICE_PAID: &str = "invoice.paid";

    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_EXHAUSTED: &str = "payment.exhausted";

    pub const DELIVERY_SCHEDULED: &str = "delivery.scheduled";
    pub const DELIVERY_ORDER_CREATED: &str = "delivery.order_created";
    pub const DELIVERY_CANCELED: &str = "delivery.canceled";
    pub const DELIVERY_SHIPPED: &str = "delivery.shipped";
    pub const DELIVERY_DELIVERED: &str = "delivery.delivered";

    pub const ENTITLEMENT_GRANTED: &str = "entitlement.granted";
    pub const ENTITLEMENT_REVOKED: &str = "entitlement.revoked";

    /// Every type the relay knows how to fan out
    pub const ALL: &[&str] = &[
        SUBSCRIPTION_CREATED,
        SUBSCRIPTION_UPDATED,
        SUBSCRIPTION_PAUSED,
        SUBSCRIPTION_RESUMED,
        SUBSCRIPTION_CANCELED,
        SUBSCRIPTION_RENEWED,
        SUBSCRIPTION_PAYMENT_EXHAUSTED,
        INVOICE_PAID,
        PAYMENT_SUCCEEDED,
        PAYMENT_FAILED,
        PAYMENT_EXHAUSTED,
        DELIVERY_SCHEDULED,
        DELIVERY_ORDER_CREATED,
        DELIVERY_CANCELED,
        DELIVERY_SHIPPED,
        DELIVERY_DELIVERED,
        ENTITLEMENT_GRANTED,
        ENTITLEMENT_REVOKED,
    ];
}

/// New outbox event, before insertion
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub event_key: Option<String>,
    pub event_payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new(event_type: &str, event_payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            event_key: None,
            event_payload,
        }
    }

    pub fn with_key(mut self, event_key: impl Into<String>) -> Self {
        self.event_key = Some(event_key.into());
        self
    }
}
