//! Webhook endpoint and delivery models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Webhook endpoint status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "webhook_endpoint_status", rename_all = "snake_case")]
pub enum WebhookEndpointStatus {
    Active,
    Disabled,
}

/// A consumer-registered webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub url: String,
    /// Shared secret for HMAC-SHA256 payload signatures
    pub secret: String,
    pub subscribed_event_types: Vec<String>,
    pub status: WebhookEndpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn is_subscribed_to(&self, event_type: &str) -> bool {
        self.subscribed_event_types
            .iter()
            .any(|t| t == event_type || t == "*")
    }
}

/// Register webhook endpoint request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterWebhookRequest {
    #[validate(url)]
    pub url: String,
    #[validate(length(min = 1))]
    pub subscribed_event_types: Vec<String>,
    /// Endpoint secret; generated when omitted
    pub secret: Option<String>,
}

/// Webhook delivery status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "webhook_delivery_status", rename_all = "snake_case")]
pub enum WebhookDeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// One outbox event fanned out to one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub endpoint_id: Uuid,
    pub outbox_event_id: Uuid,
    pub status: WebhookDeliveryStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_response_status: Option<i32>,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
