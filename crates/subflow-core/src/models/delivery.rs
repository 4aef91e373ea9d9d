//! Delivery instance model: the per-cycle fulfillment snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Currency, ShippingAddress};

/// Delivery status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, external order not yet placed
    Pending,
    /// External order placed with the commerce provider
    OrderCreated,
    Shipped,
    Delivered,
    Failed,
    Canceled,
}

impl DeliveryStatus {
    /// Cancellation is only possible before the external order exists
    pub fn is_cancellable(&self) -> bool {
        matches!(self, DeliveryStatus::Pending)
    }
}

/// One item captured into a delivery snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

/// Items plus shipping address frozen at delivery creation time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub items: Vec<DeliveryItem>,
    pub shipping_address: ShippingAddress,
    pub currency: Currency,
}

/// Delivery instance entity
///
/// Unique `(tenant_id, subscription_id, cycle_key)`: one delivery per
/// subscription per billing cycle, however many tasks race to create it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub cycle_key: String,
    pub status: DeliveryStatus,
    pub snapshot: sqlx::types::Json<DeliverySnapshot>,
    pub external_order_ref: Option<String>,
    pub cancellation_reason: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic cycle key: the same subscription and billing period always
/// map to the same key, so duplicate task runs converge on one row
pub fn cycle_key(
    subscription_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> String {
    format!(
        "{}:{}:{}",
        subscription_id,
        period_start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        period_end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}
