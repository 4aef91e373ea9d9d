//! Payment provider contract
//!
//! Provides a unified interface for collecting invoices regardless of the
//! provider. The billing core interacts with this trait only; provider
//! internals are opaque. Providers are responsible for honoring the
//! idempotency key across retries, which is what makes at-least-once
//! payment tasks safe.

pub mod providers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::Currency;
use crate::{Error, Result};

/// Payment request handed to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub invoice_id: Uuid,
    pub customer_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub payment_method_ref: String,
    /// Stable per-attempt token; the provider must not double-charge when it
    /// sees the same key twice
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

/// Provider-side payment status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderPaymentStatus {
    Succeeded,
    Pending,
    RequiresAction,
    Failed,
    Cancelled,
    Refunded,
}

/// Payment result returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProviderResult {
    pub success: bool,
    pub payment_reference: Option<String>,
    pub status: ProviderPaymentStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider_data: serde_json::Value,
}

impl PaymentProviderResult {
    pub fn succeeded(payment_reference: impl Into<String>) -> Self {
        Self {
            success: true,
            payment_reference: Some(payment_reference.into()),
            status: ProviderPaymentStatus::Succeeded,
            error_code: None,
            error_message: None,
            provider_data: serde_json::json!({}),
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            payment_reference: None,
            status: ProviderPaymentStatus::Failed,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            provider_data: serde_json::json!({}),
        }
    }
}

/// Payment provider trait
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;

    /// Collect a payment
    async fn process_payment(&self, request: PaymentRequest) -> Result<PaymentProviderResult>;

    /// Look up a payment by provider reference
    async fn get_payment_status(&self, payment_reference: &str) -> Result<ProviderPaymentStatus>;

    /// Cancel a pending payment
    async fn cancel_payment(&self, payment_reference: &str) -> Result<PaymentProviderResult>;

    /// Refund a payment, partially when an amount is given
    async fn refund_payment(
        &self,
        payment_reference: &str,
        amount_cents: Option<i64>,
        reason: Option<&str>,
    ) -> Result<PaymentProviderResult>;
}

/// Provider registry keyed by provider name; `payment.provider_name` in the
/// configuration selects which one the billing core uses
#[derive(Default)]
pub struct PaymentProviderRegistry {
    providers: HashMap<String, Arc<dyn PaymentProvider>>,
}

impl PaymentProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    pub fn get(&self, provider_name: &str) -> Result<Arc<dyn PaymentProvider>> {
        self.providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown payment provider: {}", provider_name)))
    }
}
