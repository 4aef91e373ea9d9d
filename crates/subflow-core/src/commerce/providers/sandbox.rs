//! Sandbox commerce provider

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::commerce::{CommerceProvider, OrderRequest, OrderResult, ProviderOrderStatus};
use crate::{Error, Result};

/// In-process order provider for development and tests. The delivery ID is
/// the idempotency token: repeated requests for the same delivery return the
/// original order reference.
pub struct SandboxCommerceProvider {
    orders: Mutex<HashMap<Uuid, String>>,
    failures_before_success: Mutex<HashMap<Uuid, u32>>,
}

impl SandboxCommerceProvider {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            failures_before_success: Mutex::new(HashMap::new()),
        }
    }

    /// Script the next `count` order creations of a delivery to fail
    pub fn fail_next(&self, delivery_id: Uuid, count: u32) {
        self.failures_before_success
            .lock()
            .unwrap()
            .insert(delivery_id, count);
    }
}

impl Default for SandboxCommerceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommerceProvider for SandboxCommerceProvider {
    fn id(&self) -> &'static str {
        "sandbox"
    }

    fn name(&self) -> &'static str {
        "Sandbox"
    }

    async fn create_order(&self, request: OrderRequest) -> Result<OrderResult> {
        if let Some(existing) = self.orders.lock().unwrap().get(&request.delivery_id) {
            return Ok(OrderResult::created(existing.clone()));
        }

        {
            let mut scripted = self.failures_before_success.lock().unwrap();
            if let Some(remaining) = scripted.get_mut(&request.delivery_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::network("sandbox: simulated order API outage"));
                }
            }
        }

        if request.items.is_empty() {
            return Ok(OrderResult::failed("empty_order", "sandbox: no items"));
        }

        let reference = format!("sandbox_order_{}", Uuid::new_v4());
        self.orders
            .lock()
            .unwrap()
            .insert(request.delivery_id, reference.clone());

        Ok(OrderResult::created(reference))
    }

    async fn get_order_status(&self, order_reference: &str) -> Result<ProviderOrderStatus> {
        if order_reference.starts_with("sandbox_order_") {
            Ok(ProviderOrderStatus::Created)
        } else {
            Err(Error::not_found("sandbox: unknown order reference"))
        }
    }

    async fn cancel_order(&self, order_reference: &str) -> Result<OrderResult> {
        Ok(OrderResult {
            success: true,
            order_reference: Some(order_reference.to_string()),
            status: ProviderOrderStatus::Cancelled,
            error_code: None,
            error_message: None,
            provider_data: serde_json::json!({}),
        })
    }
}
