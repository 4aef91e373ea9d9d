//! Fulfillment core
//!
//! Turns paid invoices into delivery instances and entitlements. Deliveries
//! converge on one row per billing cycle through the cycle-key constraint;
//! entitlements upsert per key. External order placement is isolated in its
//! own task with its own retry budget, keyed by the delivery so the provider
//! can deduplicate.

pub mod handlers;

pub use handlers::{CreateDeliveryHandler, CreateOrderHandler, EntitlementGrantHandler};

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::commerce::{CommerceProvider, OrderItemRequest, OrderRequest};
use crate::config::{CommerceConfig, TaskConfig};
use crate::models::{
    cycle_key, entitlement_key, event_type, DeliveryInstance, DeliveryItem, DeliverySnapshot,
    DeliveryStatus, Entitlement, Invoice, NewOutboxEvent, Subscription, SubscriptionItem,
};
use crate::repository::{
    DeliveryRepository, EntitlementRepository, InvoiceRepository, NewDelivery, NewEntitlement,
    SubscriptionRepository,
};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// What one create_order run produced
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    /// Order placed with the provider on this run
    Placed(DeliveryInstance),
    /// An earlier run already placed it
    AlreadyPlaced(DeliveryInstance),
    /// Delivery is cancelled or otherwise not orderable; nothing to do
    Skipped(DeliveryInstance),
    /// Provider rejected or errored; retryable
    Failed { code: String, message: String },
}

/// Fulfillment service
pub struct FulfillmentService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    entitlements: Arc<dyn EntitlementRepository>,
    commerce_provider: Arc<dyn CommerceProvider>,
    task_config: TaskConfig,
    commerce_config: CommerceConfig,
}

impl FulfillmentService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        entitlements: Arc<dyn EntitlementRepository>,
        commerce_provider: Arc<dyn CommerceProvider>,
        task_config: TaskConfig,
        commerce_config: CommerceConfig,
    ) -> Self {
        Self {
            subscriptions,
            invoices,
            deliveries,
            entitlements,
            commerce_provider,
            task_config,
            commerce_config,
        }
    }

    /// Create the delivery instance for a paid invoice's cycle.
    ///
    /// Duplicate runs converge on the same row; only the first one snapshots
    /// items and shipping and schedules the order task.
    pub async fn create_delivery(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<DeliveryInstance> {
        let invoice = self
            .invoices
            .find_by_id(ctx, invoice_id)
            .await?
            .ok_or_else(|| Error::not_found("Invoice not found"))?;

        let subscription = self
            .subscriptions
            .find_by_id(ctx, invoice.subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription not found"))?;

        let shipping_address = subscription
            .shipping_address
            .as_ref()
            .map(|json| json.0.clone())
            .ok_or_else(|| Error::validation("Subscription has no shipping address"))?;

        let items = self.subscriptions.items(ctx, subscription.id).await?;
        let snapshot_items = snapshot_items(&subscription, &items);
        if snapshot_items.is_empty() {
            return Err(Error::validation("Subscription has no items to deliver"));
        }

        let key = cycle_key(subscription.id, invoice.period_start, invoice.period_end);
        let snapshot = DeliverySnapshot {
            items: snapshot_items,
            shipping_address,
            currency: invoice.currency,
        };

        let (delivery, created) = self
            .deliveries
            .create(
                ctx,
                NewDelivery {
                    subscription_id: subscription.id,
                    invoice_id,
                    cycle_key: key,
                    snapshot,
                    order_task_max_attempts: self.task_config.default_max_attempts,
                },
                serde_json::json!({
                    "subscriptionId": subscription.id,
                    "invoiceId": invoice_id,
                }),
            )
            .await?;

        if created {
            tracing::info!(
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                cycle_key = %delivery.cycle_key,
                "Delivery scheduled"
            );
        }

        Ok(delivery)
    }

    /// Place the external order for a pending delivery
    pub async fn create_order(&self, ctx: &TenantContext, delivery_id: Uuid) -> Result<OrderOutcome> {
        let delivery = self
            .deliveries
            .find_by_id(ctx, delivery_id)
            .await?
            .ok_or_else(|| Error::not_found("Delivery not found"))?;

        match delivery.status {
            DeliveryStatus::Pending => {}
            DeliveryStatus::OrderCreated | DeliveryStatus::Shipped | DeliveryStatus::Delivered => {
                return Ok(OrderOutcome::AlreadyPlaced(delivery));
            }
            DeliveryStatus::Canceled | DeliveryStatus::Failed => {
                return Ok(OrderOutcome::Skipped(delivery));
            }
        }

        let invoice = self
            .invoices
            .find_by_id(ctx, delivery.invoice_id)
            .await?
            .ok_or_else(|| Error::not_found("Invoice not found"))?;

        let snapshot = &delivery.snapshot.0;
        let request = OrderRequest {
            delivery_id: delivery.id,
            customer_id: invoice.customer_id,
            items: snapshot
                .items
                .iter()
                .map(|item| OrderItemRequest {
                    product_id: item.product_id,
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                    total_cents: item.total_cents,
                })
                .collect(),
            currency: snapshot.currency,
            shipping_address: snapshot.shipping_address.clone(),
            metadata: serde_json::json!({
                "invoiceId": delivery.invoice_id,
                "cycleKey": delivery.cycle_key,
            }),
        };

        let timeout = Duration::from_secs(self.commerce_config.request_timeout_seconds);
        let result = match tokio::time::timeout(
            timeout,
            self.commerce_provider.create_order(request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::network("Commerce provider call timed out")),
        };

        if !result.success {
            return Ok(OrderOutcome::Failed {
                code: result.error_code.unwrap_or_else(|| "unknown".to_string()),
                message: result
                    .error_message
                    .unwrap_or_else(|| "order rejected".to_string()),
            });
        }

        let order_ref = result
            .order_reference
            .ok_or_else(|| Error::commerce("Provider returned success without order reference"))?;

        let mut event_delivery = delivery.clone();
        event_delivery.status = DeliveryStatus::OrderCreated;
        event_delivery.external_order_ref = Some(order_ref.clone());

        let updated = self
            .deliveries
            .set_order_created(
                ctx,
                delivery.id,
                &order_ref,
                NewOutboxEvent::new(
                    event_type::DELIVERY_ORDER_CREATED,
                    crate::outbox::payload::delivery(&event_delivery),
                )
                .with_key(format!("order_created_{}", delivery.id)),
            )
            .await?;

        match updated {
            Some(updated) => {
                tracing::info!(
                    delivery_id = %updated.id,
                    order_ref = %order_ref,
                    "External order created"
                );
                Ok(OrderOutcome::Placed(updated))
            }
            // Lost a race with another run of this task; the provider
            // deduplicated by delivery id, so converge quietly.
            None => {
                let current = self
                    .deliveries
                    .find_by_id(ctx, delivery.id)
                    .await?
                    .ok_or_else(|| Error::not_found("Delivery not found"))?;
                Ok(OrderOutcome::AlreadyPlaced(current))
            }
        }
    }

    /// Grant (or extend) entitlements for a paid invoice.
    ///
    /// Items carry no digital/physical flag, so every item on the contract
    /// is entitled; the plan type gates whether this task is scheduled at
    /// all.
    pub async fn grant_entitlement(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Vec<Entitlement>> {
        let invoice = self
            .invoices
            .find_by_id(ctx, invoice_id)
            .await?
            .ok_or_else(|| Error::not_found("Invoice not found"))?;

        let subscription = self
            .subscriptions
            .find_by_id(ctx, invoice.subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription not found"))?;

        let items = self.subscriptions.items(ctx, subscription.id).await?;
        if items.is_empty() {
            return Err(Error::validation("Subscription has no items to entitle"));
        }

        let grants: Vec<NewEntitlement> = items
            .iter()
            .map(|item| {
                let entitlement_type = item
                    .item_config
                    .get("entitlement_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("access")
                    .to_string();
                NewEntitlement {
                    customer_id: subscription.customer_id,
                    subscription_id: subscription.id,
                    entitlement_key: entitlement_key(
                        &entitlement_type,
                        subscription.id,
                        item.product_id,
                    ),
                    entitlement_type,
                    valid_from: invoice.period_start,
                    valid_until: invoice.period_end,
                    payload: serde_json::json!({
                        "invoiceId": invoice.id,
                        "productId": item.product_id,
                        "quantity": item.quantity,
                    }),
                    external_ref: None,
                }
            })
            .collect();

        let granted = self.entitlements.grant(ctx, grants).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            invoice_id = %invoice_id,
            count = granted.len(),
            "Entitlements granted"
        );

        Ok(granted)
    }

    /// Revoke a subscription's active entitlements (cancellation path)
    pub async fn revoke_entitlements(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>> {
        self.entitlements
            .revoke_for_subscription(ctx, subscription_id)
            .await
    }

    /// Cancel a delivery still inside its cancellable window
    pub async fn cancel_delivery(
        &self,
        ctx: &TenantContext,
        delivery_id: Uuid,
        reason: &str,
    ) -> Result<DeliveryInstance> {
        let delivery = self
            .deliveries
            .find_by_id(ctx, delivery_id)
            .await?
            .ok_or_else(|| Error::not_found("Delivery not found"))?;

        let mut event_delivery = delivery.clone();
        event_delivery.status = DeliveryStatus::Canceled;

        let cancelled = self
            .deliveries
            .cancel(
                ctx,
                delivery_id,
                reason,
                NewOutboxEvent::new(
                    event_type::DELIVERY_CANCELED,
                    crate::outbox::payload::delivery(&event_delivery),
                ),
            )
            .await?;

        cancelled.ok_or_else(|| {
            Error::conflict(format!(
                "Delivery cannot be cancelled in status {:?}",
                delivery.status
            ))
        })
    }

    /// Record shipment of an ordered delivery
    pub async fn mark_shipped(&self, ctx: &TenantContext, delivery_id: Uuid) -> Result<DeliveryInstance> {
        let delivery = self
            .deliveries
            .find_by_id(ctx, delivery_id)
            .await?
            .ok_or_else(|| Error::not_found("Delivery not found"))?;

        let mut event_delivery = delivery.clone();
        event_delivery.status = DeliveryStatus::Shipped;

        self.deliveries
            .mark_shipped(
                ctx,
                delivery_id,
                NewOutboxEvent::new(
                    event_type::DELIVERY_SHIPPED,
                    crate::outbox::payload::delivery(&event_delivery),
                ),
            )
            .await?
            .ok_or_else(|| Error::conflict("Delivery is not in order_created status"))
    }

    /// Record final delivery of a shipped delivery
    pub async fn mark_delivered(
        &self,
        ctx: &TenantContext,
        delivery_id: Uuid,
    ) -> Result<DeliveryInstance> {
        let delivery = self
            .deliveries
            .find_by_id(ctx, delivery_id)
            .await?
            .ok_or_else(|| Error::not_found("Delivery not found"))?;

        let mut event_delivery = delivery.clone();
        event_delivery.status = DeliveryStatus::Delivered;

        self.deliveries
            .mark_delivered(
                ctx,
                delivery_id,
                NewOutboxEvent::new(
                    event_type::DELIVERY_DELIVERED,
                    crate::outbox::payload::delivery(&event_delivery),
                ),
            )
            .await?
            .ok_or_else(|| Error::conflict("Delivery is not in shipped status"))
    }
}

fn snapshot_items(subscription: &Subscription, items: &[SubscriptionItem]) -> Vec<DeliveryItem> {
    let plan_name = &subscription.snapshot().plan_name;
    items
        .iter()
        .map(|item| {
            let name = item
                .item_config
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(plan_name)
                .to_string();
            DeliveryItem {
                product_id: item.product_id,
                product_name: name,
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
                total_cents: item.line_total_cents(),
            }
        })
        .collect()
}
