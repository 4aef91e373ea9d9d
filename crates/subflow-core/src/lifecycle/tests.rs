//! Lifecycle service tests against an in-memory contract store

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use uuid::Uuid;

use super::*;
use crate::models::{
    BillingInterval, CancellationReason, CreateCustomerRequest, CreatePlanRequest, Currency,
    Customer, CustomerStatus, Entitlement, ModifySubscriptionRequest, PlanType, ScheduledTask,
    ShippingAddress, SubscriptionHistory, SubscriptionProductRequest, TaskStatus,
};
use crate::repository::SubscriptionUpdate;

// --- In-memory mocks ---

#[derive(Default)]
struct InMemorySubscriptionRepository {
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    items: Mutex<HashMap<Uuid, Vec<crate::models::SubscriptionItem>>>,
    history: Mutex<Vec<(Uuid, String)>>,
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn create(
        &self,
        ctx: &TenantContext,
        subscription: NewSubscription,
        items: Vec<NewSubscriptionItem>,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
        _initial_task: Option<NewTask>,
    ) -> crate::Result<Subscription> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let row = Subscription {
            id,
            tenant_id: ctx.tenant_id,
            customer_id: subscription.customer_id,
            plan_id: subscription.plan_id,
            status: subscription.status,
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            next_renewal_at: subscription.next_renewal_at,
            trial_start: subscription.trial_start,
            trial_end: subscription.trial_end,
            payment_method_ref: subscription.payment_method_ref,
            shipping_address: subscription.shipping_address.map(sqlx::types::Json),
            plan_snapshot: sqlx::types::Json(subscription.plan_snapshot),
            cancel_at_period_end: false,
            canceled_at: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        let item_rows = items
            .into_iter()
            .map(|item| crate::models::SubscriptionItem {
                id: Uuid::new_v4(),
                subscription_id: id,
                plan_id: item.plan_id,
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
                currency: item.currency,
                item_config: item.item_config,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.subscriptions.lock().unwrap().insert(id, row.clone());
        self.items.lock().unwrap().insert(id, item_rows);
        self.history.lock().unwrap().push((id, history.action));
        self.events.lock().unwrap().push(event.event_type);

        Ok(row)
    }

    async fn find_by_id(&self, _ctx: &TenantContext, id: Uuid) -> crate::Result<Option<Subscription>> {
        Ok(self.subscriptions.lock().unwrap().get(&id).cloned())
    }

    async fn items(
        &self,
        _ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> crate::Result<Vec<crate::models::SubscriptionItem>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&subscription_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_item(
        &self,
        _ctx: &TenantContext,
        subscription_id: Uuid,
        item_id: Uuid,
    ) -> crate::Result<Option<crate::models::SubscriptionItem>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&subscription_id)
            .and_then(|items| items.iter().find(|i| i.id == item_id).cloned()))
    }

    async fn update_status(
        &self,
        _ctx: &TenantContext,
        id: Uuid,
        change: StatusChange,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> crate::Result<Option<Subscription>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(row) = subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != change.expected {
            return Ok(None);
        }
        row.status = change.new_status;
        if change.canceled_at.is_some() {
            row.canceled_at = change.canceled_at;
        }
        if change.cancellation_reason.is_some() {
            row.cancellation_reason = change.cancellation_reason;
        }
        if change.clear_cancel_at_period_end {
            row.cancel_at_period_end = false;
        }
        self.history.lock().unwrap().push((id, history.action));
        self.events.lock().unwrap().push(event.event_type);
        Ok(Some(row.clone()))
    }

    async fn set_cancel_at_period_end(
        &self,
        _ctx: &TenantContext,
        id: Uuid,
        reason: CancellationReason,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> crate::Result<Option<Subscription>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(row) = subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if row.status.is_terminal() {
            return Ok(None);
        }
        row.cancel_at_period_end = true;
        row.cancellation_reason = Some(reason);
        self.history.lock().unwrap().push((id, history.action));
        self.events.lock().unwrap().push(event.event_type);
        Ok(Some(row.clone()))
    }

    async fn modify(
        &self,
        _ctx: &TenantContext,
        id: Uuid,
        update: SubscriptionUpdate,
        replace_items: Option<Vec<NewSubscriptionItem>>,
        new_snapshot: Option<PlanSnapshot>,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> crate::Result<Option<Subscription>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(row) = subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if row.status.is_terminal() {
            return Ok(None);
        }
        if let Some(plan_id) = update.plan_id {
            row.plan_id = plan_id;
        }
        if let Some(pm) = update.payment_method_ref {
            row.payment_method_ref = pm;
        }
        if let Some(address) = update.shipping_address {
            row.shipping_address = Some(sqlx::types::Json(address));
        }
        if let Some(snapshot) = new_snapshot {
            row.plan_snapshot = sqlx::types::Json(snapshot);
        }
        if let Some(items) = replace_items {
            let now = Utc::now();
            let item_rows = items
                .into_iter()
                .map(|item| crate::models::SubscriptionItem {
                    id: Uuid::new_v4(),
                    subscription_id: id,
                    plan_id: item.plan_id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                    currency: item.currency,
                    item_config: item.item_config,
                    created_at: now,
                    updated_at: now,
                })
                .collect();
            self.items.lock().unwrap().insert(id, item_rows);
        }
        self.history.lock().unwrap().push((id, history.action));
        self.events.lock().unwrap().push(event.event_type);
        Ok(Some(row.clone()))
    }

    async fn append_history(
        &self,
        _ctx: &TenantContext,
        subscription_id: Uuid,
        entry: NewHistoryEntry,
    ) -> crate::Result<()> {
        self.history.lock().unwrap().push((subscription_id, entry.action));
        Ok(())
    }

    async fn history(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
    ) -> crate::Result<Vec<SubscriptionHistory>> {
        Ok(Vec::new())
    }

    async fn find_due_for_renewal_all_tenants(
        &self,
        _cursor: Option<(chrono::DateTime<Utc>, Uuid)>,
        _limit: i64,
    ) -> crate::Result<Vec<Subscription>> {
        unimplemented!()
    }

    async fn find_due_trials_all_tenants(&self, _limit: i64) -> crate::Result<Vec<Subscription>> {
        unimplemented!()
    }

    async fn find_period_end_cancellations_all_tenants(
        &self,
        _limit: i64,
    ) -> crate::Result<Vec<Subscription>> {
        unimplemented!()
    }

    async fn find_expiry_candidates_all_tenants(
        &self,
        _grace: Duration,
        _limit: i64,
    ) -> crate::Result<Vec<Subscription>> {
        unimplemented!()
    }
}

struct StubPlanRepository {
    plans: HashMap<Uuid, Plan>,
}

#[async_trait]
impl PlanRepository for StubPlanRepository {
    async fn create(&self, _ctx: &TenantContext, _request: CreatePlanRequest) -> crate::Result<Plan> {
        unimplemented!()
    }

    async fn find_by_id(&self, _ctx: &TenantContext, id: Uuid) -> crate::Result<Option<Plan>> {
        Ok(self.plans.get(&id).cloned())
    }

    async fn list(&self, _ctx: &TenantContext) -> crate::Result<Vec<Plan>> {
        Ok(self.plans.values().cloned().collect())
    }

    async fn set_status(
        &self,
        _ctx: &TenantContext,
        _id: Uuid,
        _status: PlanStatus,
    ) -> crate::Result<bool> {
        unimplemented!()
    }

    async fn has_subscriptions(&self, _ctx: &TenantContext, _id: Uuid) -> crate::Result<bool> {
        Ok(false)
    }
}

struct StubCustomerRepository {
    customer: Customer,
}

#[async_trait]
impl CustomerRepository for StubCustomerRepository {
    async fn create(
        &self,
        _ctx: &TenantContext,
        _request: CreateCustomerRequest,
    ) -> crate::Result<Customer> {
        unimplemented!()
    }

    async fn find_by_id(&self, _ctx: &TenantContext, id: Uuid) -> crate::Result<Option<Customer>> {
        Ok(Some(self.customer.clone()).filter(|c| c.id == id))
    }

    async fn find_by_email(&self, _ctx: &TenantContext, _email: &str) -> crate::Result<Option<Customer>> {
        Ok(None)
    }

    async fn list(
        &self,
        _ctx: &TenantContext,
        _page: i64,
        _per_page: i64,
    ) -> crate::Result<Vec<Customer>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingTaskRepository {
    enqueued: Mutex<Vec<NewTask>>,
    cancelled: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskRepository for RecordingTaskRepository {
    async fn enqueue(
        &self,
        _ctx: &TenantContext,
        task: NewTask,
    ) -> crate::Result<Option<ScheduledTask>> {
        let now = Utc::now();
        let row = ScheduledTask {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            task_type: task.task_type,
            task_key: task.task_key.clone(),
            status: TaskStatus::Ready,
            due_at: task.due_at,
            attempt_count: 0,
            max_attempts: task.max_attempts,
            payload: task.payload.clone(),
            locked_until: None,
            lock_owner: None,
            last_error: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.enqueued.lock().unwrap().push(task);
        Ok(Some(row))
    }

    async fn claim_batch(
        &self,
        _worker_id: &str,
        _limit: i64,
        _lease: StdDuration,
    ) -> crate::Result<Vec<ScheduledTask>> {
        Ok(Vec::new())
    }

    async fn complete(&self, _task_id: Uuid) -> crate::Result<()> {
        Ok(())
    }

    async fn fail(
        &self,
        _task_id: Uuid,
        _error: &str,
        _backoff: StdDuration,
    ) -> crate::Result<Option<ScheduledTask>> {
        Ok(None)
    }

    async fn fail_terminal(&self, _task_id: Uuid, _error: &str) -> crate::Result<Option<ScheduledTask>> {
        Ok(None)
    }

    async fn extend_lease(
        &self,
        _task_id: Uuid,
        _worker_id: &str,
        _lease: StdDuration,
    ) -> crate::Result<bool> {
        Ok(true)
    }

    async fn reap_expired(&self, _limit: i64) -> crate::Result<u64> {
        Ok(0)
    }

    async fn cancel(&self, _ctx: &TenantContext, task_key: &str) -> crate::Result<bool> {
        self.cancelled.lock().unwrap().push(task_key.to_string());
        Ok(true)
    }

    async fn find_by_key(
        &self,
        _ctx: &TenantContext,
        _task_key: &str,
    ) -> crate::Result<Option<ScheduledTask>> {
        Ok(None)
    }

    async fn count_by_status(&self) -> crate::Result<Vec<(TaskStatus, i64)>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingEntitlementRepository {
    revoked_for: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl EntitlementRepository for RecordingEntitlementRepository {
    async fn grant(
        &self,
        _ctx: &TenantContext,
        _grants: Vec<crate::repository::NewEntitlement>,
    ) -> crate::Result<Vec<Entitlement>> {
        unimplemented!()
    }

    async fn revoke_for_subscription(
        &self,
        _ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> crate::Result<Vec<Entitlement>> {
        self.revoked_for.lock().unwrap().push(subscription_id);
        Ok(Vec::new())
    }

    async fn find_by_key(
        &self,
        _ctx: &TenantContext,
        _customer_id: Uuid,
        _entitlement_key: &str,
    ) -> crate::Result<Option<Entitlement>> {
        Ok(None)
    }

    async fn list_by_subscription(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
    ) -> crate::Result<Vec<Entitlement>> {
        Ok(Vec::new())
    }

    async fn expire_lapsed_all_tenants(&self, _limit: i64) -> crate::Result<u64> {
        Ok(0)
    }
}

// --- Fixtures ---

fn plan(tenant_id: Uuid, plan_type: PlanType, trial_days: i32) -> Plan {
    let now = Utc::now();
    Plan {
        id: Uuid::new_v4(),
        tenant_id,
        name: "Monthly Box".to_string(),
        base_price_cents: 2999,
        currency: Currency::USD,
        billing_interval: BillingInterval::Monthly,
        billing_interval_count: 1,
        trial_period_days: trial_days,
        plan_type,
        status: PlanStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

fn customer(tenant_id: Uuid) -> Customer {
    let now = Utc::now();
    Customer {
        id: Uuid::new_v4(),
        tenant_id,
        email: "pat@example.com".to_string(),
        external_id: None,
        status: CustomerStatus::Active,
        attributes: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

fn address() -> ShippingAddress {
    ShippingAddress {
        line1: "1 Main St".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        state: None,
        postal_code: "12345".to_string(),
        country: "US".to_string(),
        recipient: None,
    }
}

struct Fixture {
    service: LifecycleService,
    subscriptions: Arc<InMemorySubscriptionRepository>,
    tasks: Arc<RecordingTaskRepository>,
    entitlements: Arc<RecordingEntitlementRepository>,
    tenant_id: Uuid,
    plan: Plan,
    customer: Customer,
}

fn fixture(plan_type: PlanType, trial_days: i32) -> Fixture {
    let tenant_id = Uuid::new_v4();
    let plan = plan(tenant_id, plan_type, trial_days);
    let customer = customer(tenant_id);

    let subscriptions = Arc::new(InMemorySubscriptionRepository::default());
    let tasks = Arc::new(RecordingTaskRepository::default());
    let entitlements = Arc::new(RecordingEntitlementRepository::default());

    let service = LifecycleService::new(
        subscriptions.clone(),
        Arc::new(StubPlanRepository {
            plans: HashMap::from([(plan.id, plan.clone())]),
        }),
        Arc::new(StubCustomerRepository {
            customer: customer.clone(),
        }),
        tasks.clone(),
        entitlements.clone(),
        crate::config::TaskConfig::default(),
    );

    Fixture {
        service,
        subscriptions,
        tasks,
        entitlements,
        tenant_id,
        plan,
        customer,
    }
}

fn create_request(f: &Fixture, with_address: bool) -> CreateSubscriptionRequest {
    CreateSubscriptionRequest {
        customer_id: f.customer.id,
        plan_id: f.plan.id,
        payment_method_ref: "pm_card_visa".to_string(),
        products: vec![],
        shipping_address: with_address.then(address),
        trial_period_days: None,
        start_at: None,
    }
}

// --- Creation ---

#[tokio::test]
async fn test_create_with_trial_schedules_trial_end() {
    let f = fixture(PlanType::Digital, 14);
    let ctx = TenantContext::system(f.tenant_id);

    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    assert_eq!(created.status, SubscriptionStatus::Trialing);
    assert!(created.trial_end.is_some());
    assert_eq!(created.current_period_end, created.trial_end.unwrap());

    let enqueued = f.tasks.enqueued.lock().unwrap();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].task_type, TaskType::TrialEnd);
    assert_eq!(enqueued[0].task_key, task_key::trial_end(created.id));
    assert_eq!(enqueued[0].due_at, created.trial_end.unwrap());
}

#[tokio::test]
async fn test_create_without_trial_is_active() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);

    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    assert_eq!(created.status, SubscriptionStatus::Active);
    assert!(created.trial_end.is_none());
    assert_eq!(created.next_renewal_at, created.current_period_end);
    assert!(created.current_period_start < created.current_period_end);
    assert!(f.tasks.enqueued.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_simple_subscription_gets_one_item() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);

    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();
    let items = f.subscriptions.items(&ctx, created.id).await.unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].unit_price_cents, 2999);
    assert_eq!(items[0].quantity, 1);
}

#[tokio::test]
async fn test_create_ecommerce_subscription_gets_items_per_product() {
    let f = fixture(PlanType::Physical, 0);
    let ctx = TenantContext::system(f.tenant_id);

    let mut request = create_request(&f, true);
    request.products = vec![
        SubscriptionProductRequest {
            product_id: Uuid::new_v4(),
            quantity: 2,
            unit_price_cents: Some(1499),
            item_config: None,
        },
        SubscriptionProductRequest {
            product_id: Uuid::new_v4(),
            quantity: 1,
            unit_price_cents: None,
            item_config: None,
        },
    ];

    let created = f.service.create(&ctx, request).await.unwrap();
    let items = f.subscriptions.items(&ctx, created.id).await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].unit_price_cents, 1499);
    // Defaulted to the plan base price
    assert_eq!(items[1].unit_price_cents, 2999);
}

#[tokio::test]
async fn test_enqueue_renewals_is_one_task_per_contract() {
    let f = fixture(PlanType::Physical, 0);
    let ctx = TenantContext::system(f.tenant_id);

    let mut request = create_request(&f, true);
    request.products = vec![
        SubscriptionProductRequest {
            product_id: Uuid::new_v4(),
            quantity: 1,
            unit_price_cents: None,
            item_config: None,
        },
        SubscriptionProductRequest {
            product_id: Uuid::new_v4(),
            quantity: 3,
            unit_price_cents: Some(999),
            item_config: None,
        },
    ];
    let created = f.service.create(&ctx, request).await.unwrap();

    let enqueued = f.service.enqueue_renewals(&ctx, &created).await.unwrap();
    assert_eq!(enqueued, 1);

    // Multi-item contracts still renew through a single whole-contract task
    let tasks = f.tasks.enqueued.lock().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::SubscriptionRenewal);
    assert_eq!(tasks[0].task_key, task_key::subscription_renewal(created.id));
    assert_eq!(tasks[0].due_at, created.next_renewal_at);
}

#[tokio::test]
async fn test_create_physical_without_address_rejected() {
    let f = fixture(PlanType::Physical, 0);
    let ctx = TenantContext::system(f.tenant_id);

    let err = f.service.create(&ctx, create_request(&f, false)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_create_with_unknown_plan_rejected() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);

    let mut request = create_request(&f, false);
    request.plan_id = Uuid::new_v4();

    let err = f.service.create(&ctx, request).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// --- Pause / resume ---

#[tokio::test]
async fn test_pause_and_resume() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let paused = f.service.pause(&ctx, created.id).await.unwrap();
    assert_eq!(paused.status, SubscriptionStatus::Paused);

    let resumed = f.service.resume(&ctx, created.id).await.unwrap();
    assert_eq!(resumed.status, SubscriptionStatus::Active);

    let events = f.subscriptions.events.lock().unwrap();
    assert!(events.contains(&"subscription.paused".to_string()));
    assert!(events.contains(&"subscription.resumed".to_string()));
}

#[tokio::test]
async fn test_resume_active_is_conflict() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let err = f.service.resume(&ctx, created.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

// --- Cancellation ---

#[tokio::test]
async fn test_immediate_cancel_stops_work_and_revokes() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let cancelled = f
        .service
        .cancel(
            &ctx,
            created.id,
            CancelSubscriptionRequest {
                reason: CancellationReason::CustomerRequested,
                reason_details: None,
                cancel_at_period_end: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(cancelled.status, SubscriptionStatus::Canceled);
    assert!(cancelled.canceled_at.is_some());

    let cancelled_tasks = f.tasks.cancelled.lock().unwrap();
    assert!(cancelled_tasks.contains(&task_key::subscription_renewal(created.id)));
    assert_eq!(f.entitlements.revoked_for.lock().unwrap().as_slice(), &[created.id]);
}

#[tokio::test]
async fn test_cancel_at_period_end_defers_transition() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let flagged = f
        .service
        .cancel(
            &ctx,
            created.id,
            CancelSubscriptionRequest {
                reason: CancellationReason::TooExpensive,
                reason_details: None,
                cancel_at_period_end: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(flagged.status, SubscriptionStatus::Active);
    assert!(flagged.cancel_at_period_end);
    // Nothing revoked until the period actually ends
    assert!(f.entitlements.revoked_for.lock().unwrap().is_empty());

    // The sweeper executes it once the period lapses
    let executed = f
        .service
        .execute_period_end_cancellation(&ctx, created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(executed.status, SubscriptionStatus::Canceled);
    assert_eq!(f.entitlements.revoked_for.lock().unwrap().as_slice(), &[created.id]);
}

#[tokio::test]
async fn test_cancel_twice_is_conflict() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let request = CancelSubscriptionRequest {
        reason: CancellationReason::CustomerRequested,
        reason_details: None,
        cancel_at_period_end: false,
    };
    f.service.cancel(&ctx, created.id, request.clone()).await.unwrap();

    let err = f.service.cancel(&ctx, created.id, request).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

// --- Trial end ---

#[tokio::test]
async fn test_trial_end_activates_and_schedules_first_renewal() {
    let f = fixture(PlanType::Digital, 7);
    let ctx = TenantContext::system(f.tenant_id);

    let mut request = create_request(&f, false);
    // Backdate so the trial has already lapsed
    request.start_at = Some(Utc::now() - Duration::days(8));
    let created = f.service.create(&ctx, request).await.unwrap();
    assert_eq!(created.status, SubscriptionStatus::Trialing);

    let updated = f.service.trial_end(&ctx, created.id).await.unwrap().unwrap();
    assert_eq!(updated.status, SubscriptionStatus::Active);

    let enqueued = f.tasks.enqueued.lock().unwrap();
    // Trial task at creation plus the first renewal task
    assert!(enqueued
        .iter()
        .any(|t| t.task_key == task_key::subscription_renewal(created.id)));
}

#[tokio::test]
async fn test_trial_end_on_active_subscription_is_noop() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let result = f.service.trial_end(&ctx, created.id).await.unwrap();
    assert!(result.is_none());
}

// --- Modify ---

#[tokio::test]
async fn test_modify_plan_freezes_new_snapshot() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    // A second plan the contract moves to
    let new_plan = plan(f.tenant_id, PlanType::Digital, 0);
    let service = LifecycleService::new(
        f.subscriptions.clone(),
        Arc::new(StubPlanRepository {
            plans: HashMap::from([
                (f.plan.id, f.plan.clone()),
                (new_plan.id, new_plan.clone()),
            ]),
        }),
        Arc::new(StubCustomerRepository {
            customer: f.customer.clone(),
        }),
        f.tasks.clone(),
        f.entitlements.clone(),
        crate::config::TaskConfig::default(),
    );

    let updated = service
        .modify(
            &ctx,
            created.id,
            ModifySubscriptionRequest {
                plan_id: Some(new_plan.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.plan_id, new_plan.id);
    assert_eq!(updated.snapshot().plan_id, new_plan.id);
    // Billing period untouched mid-cycle
    assert_eq!(updated.current_period_end, created.current_period_end);

    let history = f.subscriptions.history.lock().unwrap();
    assert!(history.iter().any(|(_, action)| action == "modified"));
}

// --- Expiry ---

#[tokio::test]
async fn test_expire_active_subscription() {
    let f = fixture(PlanType::Digital, 0);
    let ctx = TenantContext::system(f.tenant_id);
    let created = f.service.create(&ctx, create_request(&f, false)).await.unwrap();

    let expired = f.service.expire(&ctx, created.id).await.unwrap().unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);

    // Terminal; nothing further applies
    let again = f.service.expire(&ctx, created.id).await.unwrap();
    assert!(again.is_none());
}
