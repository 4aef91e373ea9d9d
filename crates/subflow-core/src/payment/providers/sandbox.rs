//! Sandbox payment provider
//!
//! Deterministic in-process provider for development and tests. Payments
//! succeed unless the payment method reference carries a scripted failure
//! marker, and the idempotency contract is honored by remembering every key
//! already processed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::payment::{
    PaymentProvider, PaymentProviderResult, PaymentRequest, ProviderPaymentStatus,
};
use crate::{Error, Result};

/// Scripted markers understood in `payment_method_ref`
const DECLINE_MARKER: &str = "pm_decline";
const TIMEOUT_MARKER: &str = "pm_timeout";

/// In-process provider with scriptable behavior
pub struct SandboxPaymentProvider {
    /// idempotency_key -> result already produced for it
    processed: Mutex<HashMap<String, PaymentProviderResult>>,
    /// Fail this many charges before succeeding (per invoice); supports
    /// retry-path tests
    failures_before_success: Mutex<HashMap<Uuid, u32>>,
}

impl SandboxPaymentProvider {
    pub fn new() -> Self {
        Self {
            processed: Mutex::new(HashMap::new()),
            failures_before_success: Mutex::new(HashMap::new()),
        }
    }

    /// Script the next `count` charges of an invoice to fail
    pub fn fail_next(&self, invoice_id: Uuid, count: u32) {
        self.failures_before_success
            .lock()
            .unwrap()
            .insert(invoice_id, count);
    }
}

impl Default for SandboxPaymentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProvider for SandboxPaymentProvider {
    fn id(&self) -> &'static str {
        "sandbox"
    }

    fn name(&self) -> &'static str {
        "Sandbox"
    }

    async fn process_payment(&self, request: PaymentRequest) -> Result<PaymentProviderResult> {
        // Idempotency: a replayed key returns the original outcome without
        // a second charge.
        if let Some(previous) = self.processed.lock().unwrap().get(&request.idempotency_key) {
            return Ok(previous.clone());
        }

        if request.payment_method_ref.contains(TIMEOUT_MARKER) {
            return Err(Error::network("sandbox: simulated provider timeout"));
        }

        let result = if request.payment_method_ref.contains(DECLINE_MARKER) {
            PaymentProviderResult::failed("card_declined", "sandbox: card declined")
        } else {
            let mut scripted = self.failures_before_success.lock().unwrap();
            match scripted.get_mut(&request.invoice_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    PaymentProviderResult::failed("card_declined", "sandbox: scripted failure")
                }
                _ => PaymentProviderResult::succeeded(format!("sandbox_pay_{}", Uuid::new_v4())),
            }
        };

        self.processed
            .lock()
            .unwrap()
            .insert(request.idempotency_key, result.clone());

        Ok(result)
    }

    async fn get_payment_status(&self, payment_reference: &str) -> Result<ProviderPaymentStatus> {
        if payment_reference.starts_with("sandbox_pay_") {
            Ok(ProviderPaymentStatus::Succeeded)
        } else {
            Err(Error::not_found("sandbox: unknown payment reference"))
        }
    }

    async fn cancel_payment(&self, payment_reference: &str) -> Result<PaymentProviderResult> {
        Ok(PaymentProviderResult {
            success: true,
            payment_reference: Some(payment_reference.to_string()),
            status: ProviderPaymentStatus::Cancelled,
            error_code: None,
            error_message: None,
            provider_data: serde_json::json!({}),
        })
    }

    async fn refund_payment(
        &self,
        payment_reference: &str,
        amount_cents: Option<i64>,
        reason: Option<&str>,
    ) -> Result<PaymentProviderResult> {
        Ok(PaymentProviderResult {
            success: true,
            payment_reference: Some(payment_reference.to_string()),
            status: ProviderPaymentStatus::Refunded,
            error_code: None,
            error_message: None,
            provider_data: serde_json::json!({
                "refundedCents": amount_cents,
                "reason": reason,
            }),
        })
    }
}
