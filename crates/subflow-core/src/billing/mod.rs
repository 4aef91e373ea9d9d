//! Billing core
//!
//! Renewal turns a due subscription into an open invoice covering every
//! item on the contract, rolls the billing period and schedules collection;
//! collection runs the payment provider and, on success, schedules
//! fulfillment. Billing is per cycle, never per item: one invoice exists per
//! subscription period, and every renewal trigger for that period converges
//! on it through the cycle unique key. A paid invoice makes charge_payment a
//! no-op. Post-payment fan-out is always scheduled through the task queue,
//! never executed inline, so each external side effect gets its own retry
//! budget.

pub mod handlers;

pub use handlers::{ChargePaymentHandler, ProductRenewalHandler, SubscriptionRenewalHandler};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{PaymentConfig, TaskConfig};
use crate::models::{
    event_type, history_action, Invoice, NewInvoiceLine, NewOutboxEvent, NewTask, PaymentAttempt,
    Subscription, SubscriptionItem, SubscriptionStatus, TaskType,
};
use crate::payment::{PaymentProvider, PaymentRequest};
use crate::repository::{
    InvoiceRepository, NewHistoryEntry, NewInvoiceCycle, NewPaymentAttempt, SubscriptionRepository,
};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// What one charge_payment run produced
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    /// Invoice was already settled; nothing to do
    AlreadyPaid,
    /// This attempt succeeded and fan-out is scheduled
    Paid(Invoice),
    /// This attempt failed; the dispatcher decides whether a retry remains
    Failed(PaymentAttempt),
}

/// Billing service
pub struct BillingService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    payment_provider: Arc<dyn PaymentProvider>,
    task_config: TaskConfig,
    payment_config: PaymentConfig,
}

impl BillingService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        payment_provider: Arc<dyn PaymentProvider>,
        task_config: TaskConfig,
        payment_config: PaymentConfig,
    ) -> Self {
        Self {
            subscriptions,
            invoices,
            payment_provider,
            task_config,
            payment_config,
        }
    }

    /// Renew from a per-item trigger.
    ///
    /// The invoice for a period covers every item on the contract, so an
    /// item-keyed trigger bills exactly what a whole-contract trigger does
    /// and converges on the same invoice. Racing triggers billing only
    /// their own item would underbill the cycle: there is no per-item line
    /// uniqueness, so lines cannot accumulate idempotently across tasks.
    /// The item is loaded only to reject triggers referencing a foreign or
    /// removed item.
    ///
    /// Returns `None` when the subscription is not in a renewable state;
    /// paused or terminal contracts between sweep and dispatch are skipped,
    /// not failed.
    pub async fn renew_product(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        item_id: Uuid,
    ) -> Result<Option<Invoice>> {
        let subscription = self
            .subscriptions
            .find_by_id(ctx, subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription not found"))?;

        if subscription.status != SubscriptionStatus::Active {
            tracing::info!(
                subscription_id = %subscription_id,
                status = %subscription.status,
                "Skipping renewal of non-active subscription"
            );
            return Ok(None);
        }

        self.subscriptions
            .find_item(ctx, subscription_id, item_id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription item not found"))?;

        let items = self.subscriptions.items(ctx, subscription_id).await?;
        if items.is_empty() {
            return Err(Error::validation("Subscription has no items"));
        }

        let invoice = self.renew_items(ctx, &subscription, &items).await?;
        Ok(Some(invoice))
    }

    /// Renew a whole subscription: one invoice covering every item
    pub async fn renew_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Option<Invoice>> {
        let subscription = self
            .subscriptions
            .find_by_id(ctx, subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription not found"))?;

        if subscription.status != SubscriptionStatus::Active {
            tracing::info!(
                subscription_id = %subscription_id,
                status = %subscription.status,
                "Skipping renewal of non-active subscription"
            );
            return Ok(None);
        }

        let items = self.subscriptions.items(ctx, subscription_id).await?;
        if items.is_empty() {
            return Err(Error::validation("Subscription has no items"));
        }

        let invoice = self.renew_items(ctx, &subscription, &items).await?;
        Ok(Some(invoice))
    }

    async fn renew_items(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
        items: &[SubscriptionItem],
    ) -> Result<Invoice> {
        let snapshot = subscription.snapshot();

        let period_start = subscription.next_period_start();
        let period_end = snapshot
            .billing_interval
            .advance(period_start, snapshot.billing_interval_count);

        // Idempotency anchor: one invoice per subscription period.
        if let Some(existing) = self
            .invoices
            .find_by_period(ctx, subscription.id, period_start, period_end)
            .await?
        {
            tracing::debug!(invoice_id = %existing.id, "Reusing invoice for period");
            return Ok(existing);
        }

        let lines: Vec<NewInvoiceLine> = items
            .iter()
            .map(|item| NewInvoiceLine {
                description: format!(
                    "{} ({} - {})",
                    snapshot.plan_name,
                    period_start.format("%Y-%m-%d"),
                    period_end.format("%Y-%m-%d")
                ),
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
                currency: item.currency,
            })
            .collect();

        let cycle = NewInvoiceCycle {
            subscription_id: subscription.id,
            customer_id: subscription.customer_id,
            invoice_number: invoice_number(period_start),
            period_start,
            period_end,
            currency: snapshot.currency,
            due_date: Utc::now(),
            lines,
            charge_task_max_attempts: self.task_config.default_max_attempts,
            renewed_event_payload: crate::outbox::payload::subscription(subscription),
        };

        let (invoice, created) = self.invoices.create_cycle(ctx, cycle).await?;

        if created {
            self.subscriptions
                .append_history(
                    ctx,
                    subscription.id,
                    NewHistoryEntry {
                        action: history_action::RENEWED.to_string(),
                        metadata: serde_json::json!({
                            "invoiceId": invoice.id,
                            "periodStart": period_start,
                            "periodEnd": period_end,
                        }),
                    },
                )
                .await?;
            tracing::info!(
                invoice_id = %invoice.id,
                subscription_id = %subscription.id,
                total_cents = invoice.total_cents,
                "Invoice created for renewal"
            );
        }

        Ok(invoice)
    }

    /// Collect an open invoice.
    ///
    /// `final_attempt` tells this run it is spending the task's last retry,
    /// so exhaustion events are emitted alongside the failure.
    pub async fn charge_payment(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        final_attempt: bool,
    ) -> Result<ChargeOutcome> {
        let invoice = self
            .invoices
            .find_by_id(ctx, invoice_id)
            .await?
            .ok_or_else(|| Error::not_found("Invoice not found"))?;

        if invoice.status == crate::models::InvoiceStatus::Paid {
            return Ok(ChargeOutcome::AlreadyPaid);
        }

        let subscription = self
            .subscriptions
            .find_by_id(ctx, invoice.subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription not found"))?;

        let attempt_number = self.invoices.latest_attempt_number(ctx, invoice_id).await? + 1;

        let attempt = self
            .invoices
            .insert_attempt(
                ctx,
                NewPaymentAttempt {
                    invoice_id,
                    amount_cents: invoice.total_cents,
                    currency: invoice.currency,
                    payment_method_ref: subscription.payment_method_ref.clone(),
                    attempt_number,
                },
            )
            .await?;

        let request = PaymentRequest {
            invoice_id,
            customer_id: invoice.customer_id,
            amount_cents: invoice.total_cents,
            currency: invoice.currency,
            payment_method_ref: subscription.payment_method_ref.clone(),
            idempotency_key: crate::models::payment_idempotency_key(invoice_id, attempt_number),
            metadata: serde_json::json!({
                "subscriptionId": invoice.subscription_id,
                "invoiceNumber": invoice.invoice_number,
            }),
        };

        let timeout = Duration::from_secs(self.payment_config.request_timeout_seconds);
        let result = match tokio::time::timeout(
            timeout,
            self.payment_provider.process_payment(request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::network("Payment provider call timed out"));
            }
        };

        if result.success {
            let invoice = self
                .settle_paid(ctx, &subscription, invoice, &attempt, result.payment_reference)
                .await?;
            Ok(ChargeOutcome::Paid(invoice))
        } else {
            let mut events = vec![NewOutboxEvent::new(
                event_type::PAYMENT_FAILED,
                crate::outbox::payload::payment(&invoice, &attempt),
            )];
            if final_attempt {
                events.push(NewOutboxEvent::new(
                    event_type::PAYMENT_EXHAUSTED,
                    crate::outbox::payload::payment_exhausted(
                        invoice.id,
                        invoice.subscription_id,
                        attempt_number,
                    ),
                ));
                events.push(NewOutboxEvent::new(
                    event_type::SUBSCRIPTION_PAYMENT_EXHAUSTED,
                    crate::outbox::payload::payment_exhausted(
                        invoice.id,
                        invoice.subscription_id,
                        attempt_number,
                    ),
                ));
            }

            self.invoices
                .mark_attempt_failed(
                    ctx,
                    attempt.id,
                    result.error_code.clone(),
                    result.error_message.clone(),
                    events,
                )
                .await?;

            tracing::warn!(
                invoice_id = %invoice_id,
                attempt = attempt_number,
                error_code = result.error_code.as_deref().unwrap_or("unknown"),
                final_attempt,
                "Payment attempt failed"
            );

            Ok(ChargeOutcome::Failed(attempt))
        }
    }

    /// Settle a successful attempt and schedule the post-payment fan-out
    async fn settle_paid(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
        invoice: Invoice,
        attempt: &PaymentAttempt,
        payment_reference: Option<String>,
    ) -> Result<Invoice> {
        let snapshot = subscription.snapshot();
        let now = Utc::now();

        let mut fanout_tasks = Vec::new();
        if snapshot.plan_type.has_physical() {
            if subscription.shipping_address.is_some() {
                fanout_tasks.push(NewTask::new(
                    TaskType::CreateDelivery,
                    crate::models::task_key::create_delivery(invoice.id),
                    now,
                    self.task_config.default_max_attempts,
                    serde_json::to_value(crate::models::task_payload::CreateDelivery {
                        invoice_id: invoice.id,
                    })?,
                ));
            } else {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    "Physical plan without shipping address; skipping delivery"
                );
            }
        }
        if snapshot.plan_type.has_digital() {
            fanout_tasks.push(NewTask::new(
                TaskType::EntitlementGrant,
                crate::models::task_key::entitlement_grant(invoice.id),
                now,
                self.task_config.default_max_attempts,
                serde_json::to_value(crate::models::task_payload::EntitlementGrant {
                    invoice_id: invoice.id,
                })?,
            ));
        }

        let mut succeeded_attempt = attempt.clone();
        succeeded_attempt.status = crate::models::PaymentAttemptStatus::Succeeded;
        succeeded_attempt.external_payment_id = payment_reference.clone();

        let events = vec![
            NewOutboxEvent::new(
                event_type::INVOICE_PAID,
                crate::outbox::payload::invoice(&invoice),
            )
            .with_key(format!("invoice_paid_{}", invoice.id)),
            NewOutboxEvent::new(
                event_type::PAYMENT_SUCCEEDED,
                crate::outbox::payload::payment(&invoice, &succeeded_attempt),
            ),
        ];

        let paid = self
            .invoices
            .mark_paid(ctx, invoice.id, attempt.id, payment_reference, fanout_tasks, events)
            .await?;

        tracing::info!(
            invoice_id = %paid.id,
            subscription_id = %subscription.id,
            amount_cents = paid.total_cents,
            "Invoice paid"
        );

        Ok(paid)
    }
}

/// Invoice numbers are unique per tenant; the date prefix keeps them
/// operator-readable
fn invoice_number(period_start: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("INV-{}-{}", period_start.format("%Y%m%d"), &suffix[..8])
}

#[cfg(test)]
mod tests;
