//! Subscription lifecycle
//!
//! Create, pause, resume, cancel and modify contracts, plus the trial-end
//! and period-end transitions driven by tasks and the sweeper. Every
//! transition writes an audit row and emits its outbox event in the same
//! transaction as the status change; the state machine is validated here and
//! enforced again by the repository's expected-status guard, so a lost race
//! surfaces as a conflict instead of a double transition.
//!
//! The engine bills from the second period on: the checkout flow that
//! created the contract settles the first period (or the trial covers it),
//! and `next_renewal_at` points at the first renewal the core owns.

pub mod handlers;

pub use handlers::TrialEndHandler;

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::config::TaskConfig;
use crate::models::{
    event_type, history_action, task_key, task_payload, CancelSubscriptionRequest,
    CreateSubscriptionRequest, NewOutboxEvent, NewTask, Plan, PlanSnapshot, PlanStatus,
    Subscription, SubscriptionStatus, TaskType,
};
use crate::outbox::payload;
use crate::repository::{
    CustomerRepository, EntitlementRepository, NewHistoryEntry, NewSubscription,
    NewSubscriptionItem, PlanRepository, StatusChange, SubscriptionRepository, TaskRepository,
};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// Subscription lifecycle service
pub struct LifecycleService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    plans: Arc<dyn PlanRepository>,
    customers: Arc<dyn CustomerRepository>,
    tasks: Arc<dyn TaskRepository>,
    entitlements: Arc<dyn EntitlementRepository>,
    task_config: TaskConfig,
}

impl LifecycleService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        plans: Arc<dyn PlanRepository>,
        customers: Arc<dyn CustomerRepository>,
        tasks: Arc<dyn TaskRepository>,
        entitlements: Arc<dyn EntitlementRepository>,
        task_config: TaskConfig,
    ) -> Self {
        Self {
            subscriptions,
            plans,
            customers,
            tasks,
            entitlements,
            task_config,
        }
    }

    /// Create a subscription: freeze the plan snapshot, build the item set,
    /// compute trial/period bounds, and commit contract + items + audit +
    /// event + first task atomically.
    pub async fn create(
        &self,
        ctx: &TenantContext,
        request: CreateSubscriptionRequest,
    ) -> Result<Subscription> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let customer = self
            .customers
            .find_by_id(ctx, request.customer_id)
            .await?
            .ok_or_else(|| Error::not_found("Customer not found"))?;

        let plan = self
            .plans
            .find_by_id(ctx, request.plan_id)
            .await?
            .ok_or_else(|| Error::not_found("Plan not found"))?;

        if plan.status != PlanStatus::Active {
            return Err(Error::validation("Plan is not active"));
        }

        let snapshot = plan_snapshot(&plan);
        let start = request.start_at.unwrap_or_else(Utc::now);
        let trial_days = request
            .trial_period_days
            .unwrap_or(plan.trial_period_days)
            .max(0);

        let (status, trial_start, trial_end, period_end) = if trial_days > 0 {
            let trial_end = start + Duration::days(trial_days as i64);
            (
                SubscriptionStatus::Trialing,
                Some(start),
                Some(trial_end),
                trial_end,
            )
        } else {
            let period_end = snapshot
                .billing_interval
                .advance(start, snapshot.billing_interval_count);
            (SubscriptionStatus::Active, None, None, period_end)
        };

        let items = build_items(&plan, &request);
        if items.is_empty() {
            return Err(Error::validation("Subscription needs at least one item"));
        }

        if plan.plan_type.has_physical() && request.shipping_address.is_none() {
            return Err(Error::validation(
                "Physical plans require a shipping address",
            ));
        }

        let new_subscription = NewSubscription {
            customer_id: customer.id,
            plan_id: plan.id,
            status,
            current_period_start: start,
            current_period_end: period_end,
            next_renewal_at: period_end,
            trial_start,
            trial_end,
            payment_method_ref: request.payment_method_ref.clone(),
            shipping_address: request.shipping_address.clone(),
            plan_snapshot: snapshot,
        };

        let created = self
            .subscriptions
            .create(
                ctx,
                new_subscription,
                items,
                NewHistoryEntry {
                    action: history_action::CREATED.to_string(),
                    metadata: serde_json::json!({
                        "planId": plan.id,
                        "trialDays": trial_days,
                    }),
                },
                NewOutboxEvent::new(
                    event_type::SUBSCRIPTION_CREATED,
                    serde_json::json!({
                        "customerId": customer.id,
                        "planId": plan.id,
                        "status": status,
                        "currentPeriodStart": start,
                        "currentPeriodEnd": period_end,
                    }),
                ),
                None,
            )
            .await?;

        // Trials schedule their own end (the task key needs the new id, so
        // this runs after the insert); active contracts are picked up by the
        // sweeper at next_renewal_at.
        if let Some(due) = created.trial_end {
            self.tasks
                .enqueue(
                    ctx,
                    NewTask::new(
                        TaskType::TrialEnd,
                        task_key::trial_end(created.id),
                        due,
                        self.task_config.default_max_attempts,
                        serde_json::to_value(task_payload::TrialEnd {
                            subscription_id: created.id,
                        })?,
                    ),
                )
                .await?;
        }

        tracing::info!(
            subscription_id = %created.id,
            customer_id = %customer.id,
            status = %created.status,
            "Subscription created"
        );

        Ok(created)
    }

    /// Pause an active or trialing subscription
    pub async fn pause(&self, ctx: &TenantContext, id: Uuid) -> Result<Subscription> {
        let subscription = self.load(ctx, id).await?;
        self.ensure_transition(&subscription, SubscriptionStatus::Paused)?;

        self.transition(
            ctx,
            &subscription,
            StatusChange::simple(subscription.status, SubscriptionStatus::Paused),
            history_action::PAUSED,
            event_type::SUBSCRIPTION_PAUSED,
            serde_json::json!({}),
        )
        .await
    }

    /// Resume a paused subscription.
    ///
    /// A renewal that came due while paused runs at the next sweep.
    pub async fn resume(&self, ctx: &TenantContext, id: Uuid) -> Result<Subscription> {
        let subscription = self.load(ctx, id).await?;
        self.ensure_transition(&subscription, SubscriptionStatus::Active)?;

        self.transition(
            ctx,
            &subscription,
            StatusChange::simple(subscription.status, SubscriptionStatus::Active),
            history_action::RESUMED,
            event_type::SUBSCRIPTION_RESUMED,
            serde_json::json!({}),
        )
        .await
    }

    /// Cancel a subscription, immediately or at period end
    pub async fn cancel(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        request: CancelSubscriptionRequest,
    ) -> Result<Subscription> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let subscription = self.load(ctx, id).await?;
        if subscription.status.is_terminal() {
            return Err(Error::conflict("Subscription is already terminal"));
        }

        if request.cancel_at_period_end {
            let updated = self
                .subscriptions
                .set_cancel_at_period_end(
                    ctx,
                    id,
                    request.reason,
                    NewHistoryEntry {
                        action: history_action::CANCELED.to_string(),
                        metadata: serde_json::json!({
                            "atPeriodEnd": true,
                            "reason": request.reason,
                            "details": request.reason_details,
                        }),
                    },
                    NewOutboxEvent::new(
                        event_type::SUBSCRIPTION_UPDATED,
                        payload::subscription(&subscription),
                    ),
                )
                .await?
                .ok_or_else(|| Error::conflict("Subscription state changed concurrently"))?;

            tracing::info!(subscription_id = %id, "Cancellation deferred to period end");
            return Ok(updated);
        }

        self.ensure_transition(&subscription, SubscriptionStatus::Canceled)?;

        let updated = self
            .transition(
                ctx,
                &subscription,
                StatusChange {
                    expected: subscription.status,
                    new_status: SubscriptionStatus::Canceled,
                    canceled_at: Some(Utc::now()),
                    cancellation_reason: Some(request.reason),
                    clear_cancel_at_period_end: false,
                },
                history_action::CANCELED,
                event_type::SUBSCRIPTION_CANCELED,
                serde_json::json!({
                    "reason": request.reason,
                    "details": request.reason_details,
                }),
            )
            .await?;

        self.stop_scheduled_work(ctx, &updated).await?;
        self.entitlements.revoke_for_subscription(ctx, id).await?;

        Ok(updated)
    }

    /// Modify mutable contract fields. A plan change freezes a new snapshot
    /// that applies from the next renewal; per-cycle snapshots already
    /// written are never touched. No proration is applied mid-cycle.
    pub async fn modify(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        request: crate::models::ModifySubscriptionRequest,
    ) -> Result<Subscription> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let subscription = self.load(ctx, id).await?;
        if subscription.status.is_terminal() {
            return Err(Error::conflict("Subscription is already terminal"));
        }

        let mut new_snapshot = None;
        let mut replace_items = None;
        let mut metadata = serde_json::Map::new();

        if let Some(plan_id) = request.plan_id {
            let plan = self
                .plans
                .find_by_id(ctx, plan_id)
                .await?
                .ok_or_else(|| Error::not_found("Plan not found"))?;
            if plan.status != PlanStatus::Active {
                return Err(Error::validation("Plan is not active"));
            }

            metadata.insert(
                "plan".to_string(),
                serde_json::json!({
                    "old": subscription.plan_id,
                    "new": plan.id,
                }),
            );

            if let Some(ref products) = request.items {
                replace_items = Some(build_items_from_products(&plan, products));
            }
            new_snapshot = Some(plan_snapshot(&plan));
        } else if let Some(ref products) = request.items {
            // Item changes against the current snapshot
            let snapshot = subscription.snapshot().clone();
            replace_items = Some(
                products
                    .iter()
                    .map(|p| NewSubscriptionItem {
                        plan_id: subscription.plan_id,
                        product_id: p.product_id,
                        quantity: p.quantity,
                        unit_price_cents: p.unit_price_cents.unwrap_or(snapshot.base_price_cents),
                        currency: snapshot.currency,
                        item_config: p.item_config.clone().unwrap_or_else(|| serde_json::json!({})),
                    })
                    .collect(),
            );
        }

        if request.shipping_address.is_some() {
            metadata.insert("shippingAddress".to_string(), serde_json::json!("updated"));
        }
        if request.payment_method_ref.is_some() {
            metadata.insert("paymentMethod".to_string(), serde_json::json!("updated"));
        }

        let updated = self
            .subscriptions
            .modify(
                ctx,
                id,
                crate::repository::SubscriptionUpdate {
                    plan_id: request.plan_id,
                    payment_method_ref: request.payment_method_ref,
                    shipping_address: request.shipping_address,
                },
                replace_items,
                new_snapshot,
                NewHistoryEntry {
                    action: history_action::MODIFIED.to_string(),
                    metadata: serde_json::Value::Object(metadata),
                },
                NewOutboxEvent::new(
                    event_type::SUBSCRIPTION_UPDATED,
                    payload::subscription(&subscription),
                ),
            )
            .await?
            .ok_or_else(|| Error::conflict("Subscription state changed concurrently"))?;

        tracing::info!(subscription_id = %id, "Subscription modified");

        Ok(updated)
    }

    /// Trial-end transition: trialing -> active once the trial has lapsed,
    /// plus the first paid cycle's renewal tasks. Idempotent; a subscription
    /// already out of trial is a no-op.
    pub async fn trial_end(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Subscription>> {
        let subscription = self.load(ctx, id).await?;

        if subscription.status != SubscriptionStatus::Trialing {
            return Ok(None);
        }

        let trial_end = subscription
            .trial_end
            .ok_or_else(|| Error::validation("Trialing subscription has no trial_end"))?;
        if trial_end > Utc::now() {
            return Err(Error::validation("Trial has not ended yet"));
        }

        let updated = self
            .transition(
                ctx,
                &subscription,
                StatusChange::simple(SubscriptionStatus::Trialing, SubscriptionStatus::Active),
                history_action::TRIAL_ENDED,
                event_type::SUBSCRIPTION_UPDATED,
                serde_json::json!({ "trialEnd": trial_end }),
            )
            .await?;

        // First paid cycle: make sure renewal work exists even before the
        // next sweep.
        self.enqueue_renewals(ctx, &updated).await?;

        Ok(Some(updated))
    }

    /// Execute a deferred cancellation whose period has ended (sweeper path)
    pub async fn execute_period_end_cancellation(
        &self,
        ctx: &TenantContext,
        id: Uuid,
    ) -> Result<Option<Subscription>> {
        let subscription = self.load(ctx, id).await?;
        if !(subscription.status == SubscriptionStatus::Active && subscription.cancel_at_period_end)
        {
            return Ok(None);
        }

        let updated = self
            .transition(
                ctx,
                &subscription,
                StatusChange {
                    expected: SubscriptionStatus::Active,
                    new_status: SubscriptionStatus::Canceled,
                    canceled_at: Some(Utc::now()),
                    cancellation_reason: subscription.cancellation_reason,
                    clear_cancel_at_period_end: false,
                },
                history_action::CANCELED,
                event_type::SUBSCRIPTION_CANCELED,
                serde_json::json!({ "atPeriodEnd": true }),
            )
            .await?;

        self.stop_scheduled_work(ctx, &updated).await?;
        self.entitlements.revoke_for_subscription(ctx, id).await?;

        Ok(Some(updated))
    }

    /// Expire an active subscription whose period ended without renewal
    /// (sweeper path)
    pub async fn expire(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Subscription>> {
        let subscription = self.load(ctx, id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Ok(None);
        }

        let updated = self
            .transition(
                ctx,
                &subscription,
                StatusChange::simple(SubscriptionStatus::Active, SubscriptionStatus::Expired),
                history_action::EXPIRED,
                event_type::SUBSCRIPTION_UPDATED,
                serde_json::json!({ "periodEnd": subscription.current_period_end }),
            )
            .await?;

        self.stop_scheduled_work(ctx, &updated).await?;

        Ok(Some(updated))
    }

    /// List a subscription's audit history, newest first
    pub async fn history(
        &self,
        ctx: &TenantContext,
        id: Uuid,
    ) -> Result<Vec<crate::models::SubscriptionHistory>> {
        self.load(ctx, id).await?;
        self.subscriptions.history(ctx, id).await
    }

    /// Enqueue the contract's renewal task, keyed so duplicates collapse.
    ///
    /// Renewal is whole-contract work regardless of item count: the cycle
    /// invoice covers every item, so a single task per subscription per
    /// cycle is both sufficient and the only shape that cannot race itself
    /// into a partial invoice.
    pub async fn enqueue_renewals(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
    ) -> Result<u64> {
        let task = NewTask::new(
            TaskType::SubscriptionRenewal,
            task_key::subscription_renewal(subscription.id),
            subscription.next_renewal_at,
            self.task_config.default_max_attempts,
            serde_json::to_value(task_payload::SubscriptionRenewal {
                subscription_id: subscription.id,
            })?,
        );

        Ok(if self.tasks.enqueue(ctx, task).await?.is_some() {
            1
        } else {
            0
        })
    }

    async fn load(&self, ctx: &TenantContext, id: Uuid) -> Result<Subscription> {
        self.subscriptions
            .find_by_id(ctx, id)
            .await?
            .ok_or_else(|| Error::not_found("Subscription not found"))
    }

    fn ensure_transition(&self, subscription: &Subscription, to: SubscriptionStatus) -> Result<()> {
        if !subscription.status.can_transition_to(to) {
            return Err(Error::conflict(format!(
                "Cannot transition subscription from {} to {}",
                subscription.status, to
            )));
        }
        Ok(())
    }

    async fn transition(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
        change: StatusChange,
        action: &str,
        event: &str,
        metadata: serde_json::Value,
    ) -> Result<Subscription> {
        let new_status = change.new_status;
        let updated = self
            .subscriptions
            .update_status(
                ctx,
                subscription.id,
                change,
                NewHistoryEntry {
                    action: action.to_string(),
                    metadata,
                },
                NewOutboxEvent::new(event, payload::subscription(subscription)),
            )
            .await?
            .ok_or_else(|| Error::conflict("Subscription state changed concurrently"))?;

        tracing::info!(
            subscription_id = %subscription.id,
            from = %subscription.status,
            to = %new_status,
            "Subscription transitioned"
        );

        Ok(updated)
    }

    /// Cancel any still-pending renewal or trial work for a terminal contract
    async fn stop_scheduled_work(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
    ) -> Result<()> {
        let items = self.subscriptions.items(ctx, subscription.id).await?;

        self.tasks
            .cancel(ctx, &task_key::subscription_renewal(subscription.id))
            .await?;
        self.tasks
            .cancel(ctx, &task_key::trial_end(subscription.id))
            .await?;
        for item in &items {
            self.tasks
                .cancel(ctx, &task_key::product_renewal(subscription.id, item.product_id))
                .await?;
        }

        Ok(())
    }
}

fn plan_snapshot(plan: &Plan) -> PlanSnapshot {
    PlanSnapshot {
        plan_id: plan.id,
        plan_name: plan.name.clone(),
        base_price_cents: plan.base_price_cents,
        currency: plan.currency,
        billing_interval: plan.billing_interval,
        billing_interval_count: plan.billing_interval_count,
        trial_period_days: plan.trial_period_days,
        plan_type: plan.plan_type,
    }
}

fn build_items(plan: &Plan, request: &CreateSubscriptionRequest) -> Vec<NewSubscriptionItem> {
    if request.products.is_empty() {
        // Simple subscription: one item derived from the plan itself
        return vec![NewSubscriptionItem {
            plan_id: plan.id,
            product_id: plan.id,
            quantity: 1,
            unit_price_cents: plan.base_price_cents,
            currency: plan.currency,
            item_config: serde_json::json!({}),
        }];
    }
    build_items_from_products(plan, &request.products)
}

fn build_items_from_products(
    plan: &Plan,
    products: &[crate::models::SubscriptionProductRequest],
) -> Vec<NewSubscriptionItem> {
    products
        .iter()
        .map(|p| NewSubscriptionItem {
            plan_id: plan.id,
            product_id: p.product_id,
            quantity: p.quantity,
            unit_price_cents: p.unit_price_cents.unwrap_or(plan.base_price_cents),
            currency: plan.currency,
            item_config: p.item_config.clone().unwrap_or_else(|| serde_json::json!({})),
        })
        .collect()
}

#[cfg(test)]
mod tests;
