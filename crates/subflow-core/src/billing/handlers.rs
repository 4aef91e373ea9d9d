//! Billing task handlers
//!
//! Thin adapters from claimed task rows to the billing service. Payload
//! parse failures and missing entities are terminal; provider trouble is
//! transient and rides the task's retry budget.

use async_trait::async_trait;
use std::sync::Arc;

use crate::billing::{BillingService, ChargeOutcome};
use crate::models::{task_payload, ScheduledTask};
use crate::tasks::{HandlerOutcome, TaskHandler};
use crate::tenant::TenantContext;

/// product_renewal -> BillingService::renew_product
///
/// Item-keyed triggers converge on the period's single whole-contract
/// invoice, so however many of them fire for one cycle, the outcome matches
/// a subscription_renewal run.
pub struct ProductRenewalHandler {
    billing: Arc<BillingService>,
}

impl ProductRenewalHandler {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }
}

#[async_trait]
impl TaskHandler for ProductRenewalHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::ProductRenewal = match serde_json::from_value(task.payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => return HandlerOutcome::Terminal(format!("Bad renewal payload: {}", e)),
        };

        match self
            .billing
            .renew_product(ctx, payload.subscription_id, payload.item_id)
            .await
        {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}

/// subscription_renewal -> BillingService::renew_subscription
pub struct SubscriptionRenewalHandler {
    billing: Arc<BillingService>,
}

impl SubscriptionRenewalHandler {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }
}

#[async_trait]
impl TaskHandler for SubscriptionRenewalHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::SubscriptionRenewal =
            match serde_json::from_value(task.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => return HandlerOutcome::Terminal(format!("Bad renewal payload: {}", e)),
            };

        match self
            .billing
            .renew_subscription(ctx, payload.subscription_id)
            .await
        {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}

/// charge_payment -> BillingService::charge_payment
pub struct ChargePaymentHandler {
    billing: Arc<BillingService>,
}

impl ChargePaymentHandler {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }
}

#[async_trait]
impl TaskHandler for ChargePaymentHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::ChargePayment = match serde_json::from_value(task.payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => return HandlerOutcome::Terminal(format!("Bad payment payload: {}", e)),
        };

        // The run spending the task's last attempt also emits exhaustion
        // events with its failure.
        let final_attempt = task.attempt_count + 1 >= task.max_attempts;

        match self
            .billing
            .charge_payment(ctx, payload.invoice_id, final_attempt)
            .await
        {
            Ok(ChargeOutcome::AlreadyPaid) | Ok(ChargeOutcome::Paid(_)) => HandlerOutcome::Success,
            Ok(ChargeOutcome::Failed(attempt)) => HandlerOutcome::Transient(format!(
                "Payment attempt {} failed: {}",
                attempt.attempt_number,
                attempt.failure_reason.as_deref().unwrap_or("declined")
            )),
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}
