//! Fulfillment task handlers

use async_trait::async_trait;
use std::sync::Arc;

use crate::fulfillment::{FulfillmentService, OrderOutcome};
use crate::models::{task_payload, ScheduledTask};
use crate::tasks::{HandlerOutcome, TaskHandler};
use crate::tenant::TenantContext;

/// create_delivery -> FulfillmentService::create_delivery
pub struct CreateDeliveryHandler {
    fulfillment: Arc<FulfillmentService>,
}

impl CreateDeliveryHandler {
    pub fn new(fulfillment: Arc<FulfillmentService>) -> Self {
        Self { fulfillment }
    }
}

#[async_trait]
impl TaskHandler for CreateDeliveryHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::CreateDelivery = match serde_json::from_value(task.payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => return HandlerOutcome::Terminal(format!("Bad delivery payload: {}", e)),
        };

        match self.fulfillment.create_delivery(ctx, payload.invoice_id).await {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}

/// create_order -> FulfillmentService::create_order
pub struct CreateOrderHandler {
    fulfillment: Arc<FulfillmentService>,
}

impl CreateOrderHandler {
    pub fn new(fulfillment: Arc<FulfillmentService>) -> Self {
        Self { fulfillment }
    }
}

#[async_trait]
impl TaskHandler for CreateOrderHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::CreateOrder = match serde_json::from_value(task.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return HandlerOutcome::Terminal(format!("Bad order payload: {}", e)),
        };

        match self.fulfillment.create_order(ctx, payload.delivery_id).await {
            Ok(OrderOutcome::Placed(_))
            | Ok(OrderOutcome::AlreadyPlaced(_))
            | Ok(OrderOutcome::Skipped(_)) => HandlerOutcome::Success,
            Ok(OrderOutcome::Failed { code, message }) => {
                HandlerOutcome::Transient(format!("Order rejected ({}): {}", code, message))
            }
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}

/// entitlement_grant -> FulfillmentService::grant_entitlement
pub struct EntitlementGrantHandler {
    fulfillment: Arc<FulfillmentService>,
}

impl EntitlementGrantHandler {
    pub fn new(fulfillment: Arc<FulfillmentService>) -> Self {
        Self { fulfillment }
    }
}

#[async_trait]
impl TaskHandler for EntitlementGrantHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::EntitlementGrant =
            match serde_json::from_value(task.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => return HandlerOutcome::Terminal(format!("Bad entitlement payload: {}", e)),
            };

        match self.fulfillment.grant_entitlement(ctx, payload.invoice_id).await {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}
