//! Commerce provider contract
//!
//! External order placement for physical fulfillment. The fulfillment core
//! interacts with this trait only; the delivery's own ID doubles as the
//! provider idempotency token, so retried order tasks are safe.

pub mod providers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Currency, ShippingAddress};
use crate::{Error, Result};

/// One order line sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

/// Order creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub delivery_id: Uuid,
    pub customer_id: Uuid,
    pub items: Vec<OrderItemRequest>,
    pub currency: Currency,
    pub shipping_address: ShippingAddress,
    pub metadata: serde_json::Value,
}

/// Provider-side order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderOrderStatus {
    Created,
    Shipped,
    Delivered,
    Cancelled,
    Failed,
}

/// Order result returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_reference: Option<String>,
    pub status: ProviderOrderStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider_data: serde_json::Value,
}

impl OrderResult {
    pub fn created(order_reference: impl Into<String>) -> Self {
        Self {
            success: true,
            order_reference: Some(order_reference.into()),
            status: ProviderOrderStatus::Created,
            error_code: None,
            error_message: None,
            provider_data: serde_json::json!({}),
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_reference: None,
            status: ProviderOrderStatus::Failed,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            provider_data: serde_json::json!({}),
        }
    }
}

/// Commerce provider trait
#[async_trait]
pub trait CommerceProvider: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;

    /// Place an external order for a delivery snapshot
    async fn create_order(&self, request: OrderRequest) -> Result<OrderResult>;

    /// Look up an order by provider reference
    async fn get_order_status(&self, order_reference: &str) -> Result<ProviderOrderStatus>;

    /// Cancel an order
    async fn cancel_order(&self, order_reference: &str) -> Result<OrderResult>;
}

/// Provider registry keyed by provider name
#[derive(Default)]
pub struct CommerceProviderRegistry {
    providers: HashMap<String, Arc<dyn CommerceProvider>>,
}

impl CommerceProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(mut self, provider: Arc<dyn CommerceProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    pub fn get(&self, provider_name: &str) -> Result<Arc<dyn CommerceProvider>> {
        self.providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown commerce provider: {}", provider_name)))
    }
}
