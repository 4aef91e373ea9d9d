//! Billing service tests against mock repositories and the sandbox provider

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::*;
use crate::models::{
    BillingInterval, Currency, InvoiceStatus, NewOutboxEvent, PaymentAttemptStatus, PlanSnapshot,
    PlanType, SubscriptionHistory,
};
use crate::payment::providers::SandboxPaymentProvider;
use crate::repository::subscription_repository::{
    NewSubscription, NewSubscriptionItem, StatusChange, SubscriptionUpdate,
};
use crate::repository::{
    InvoiceRepository, NewHistoryEntry, NewInvoiceCycle, NewPaymentAttempt, SubscriptionRepository,
};

// --- Mock repositories ---

struct MockSubscriptionRepository {
    subscription: Option<Subscription>,
    items: Vec<SubscriptionItem>,
    history: Mutex<Vec<NewHistoryEntry>>,
}

impl MockSubscriptionRepository {
    fn with(subscription: Subscription, items: Vec<SubscriptionItem>) -> Self {
        Self {
            subscription: Some(subscription),
            items,
            history: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SubscriptionRepository for MockSubscriptionRepository {
    async fn create(
        &self,
        _ctx: &TenantContext,
        _subscription: NewSubscription,
        _items: Vec<NewSubscriptionItem>,
        _history: NewHistoryEntry,
        _event: NewOutboxEvent,
        _initial_task: Option<NewTask>,
    ) -> Result<Subscription> {
        unimplemented!()
    }

    async fn find_by_id(&self, _ctx: &TenantContext, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.subscription.clone().filter(|s| s.id == id))
    }

    async fn items(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>> {
        Ok(self.items.clone())
    }

    async fn find_item(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
        item_id: Uuid,
    ) -> Result<Option<SubscriptionItem>> {
        Ok(self.items.iter().find(|i| i.id == item_id).cloned())
    }

    async fn update_status(
        &self,
        _ctx: &TenantContext,
        _id: Uuid,
        _change: StatusChange,
        _history: NewHistoryEntry,
        _event: NewOutboxEvent,
    ) -> Result<Option<Subscription>> {
        unimplemented!()
    }

    async fn set_cancel_at_period_end(
        &self,
        _ctx: &TenantContext,
        _id: Uuid,
        _reason: crate::models::CancellationReason,
        _history: NewHistoryEntry,
        _event: NewOutboxEvent,
    ) -> Result<Option<Subscription>> {
        unimplemented!()
    }

    async fn modify(
        &self,
        _ctx: &TenantContext,
        _id: Uuid,
        _update: SubscriptionUpdate,
        _replace_items: Option<Vec<NewSubscriptionItem>>,
        _new_snapshot: Option<PlanSnapshot>,
        _history: NewHistoryEntry,
        _event: NewOutboxEvent,
    ) -> Result<Option<Subscription>> {
        unimplemented!()
    }

    async fn append_history(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
        entry: NewHistoryEntry,
    ) -> Result<()> {
        self.history.lock().unwrap().push(entry);
        Ok(())
    }

    async fn history(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>> {
        Ok(Vec::new())
    }

    async fn find_due_for_renewal_all_tenants(
        &self,
        _cursor: Option<(chrono::DateTime<Utc>, Uuid)>,
        _limit: i64,
    ) -> Result<Vec<Subscription>> {
        unimplemented!()
    }

    async fn find_due_trials_all_tenants(&self, _limit: i64) -> Result<Vec<Subscription>> {
        unimplemented!()
    }

    async fn find_period_end_cancellations_all_tenants(
        &self,
        _limit: i64,
    ) -> Result<Vec<Subscription>> {
        unimplemented!()
    }

    async fn find_expiry_candidates_all_tenants(
        &self,
        _grace: chrono::Duration,
        _limit: i64,
    ) -> Result<Vec<Subscription>> {
        unimplemented!()
    }
}

#[derive(Default)]
struct MockInvoiceRepository {
    existing_by_period: Mutex<Option<Invoice>>,
    invoice: Mutex<Option<Invoice>>,
    created_cycles: Mutex<Vec<NewInvoiceCycle>>,
    attempts: Mutex<Vec<NewPaymentAttempt>>,
    paid_calls: Mutex<Vec<(Uuid, Vec<NewTask>, Vec<NewOutboxEvent>)>>,
    failed_calls: Mutex<Vec<(Uuid, Vec<NewOutboxEvent>)>>,
}

fn invoice_from_cycle(tenant_id: Uuid, cycle: &NewInvoiceCycle) -> Invoice {
    let now = Utc::now();
    let subtotal = cycle.subtotal_cents();
    Invoice {
        id: Uuid::new_v4(),
        tenant_id,
        subscription_id: cycle.subscription_id,
        customer_id: cycle.customer_id,
        invoice_number: cycle.invoice_number.clone(),
        period_start: cycle.period_start,
        period_end: cycle.period_end,
        subtotal_cents: subtotal,
        tax_cents: 0,
        total_cents: subtotal,
        currency: cycle.currency,
        status: InvoiceStatus::Open,
        due_date: cycle.due_date,
        paid_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl InvoiceRepository for MockInvoiceRepository {
    async fn find_by_period(
        &self,
        _ctx: &TenantContext,
        _subscription_id: Uuid,
        _period_start: chrono::DateTime<Utc>,
        _period_end: chrono::DateTime<Utc>,
    ) -> Result<Option<Invoice>> {
        Ok(self.existing_by_period.lock().unwrap().clone())
    }

    async fn find_by_id(&self, _ctx: &TenantContext, id: Uuid) -> Result<Option<Invoice>> {
        Ok(self.invoice.lock().unwrap().clone().filter(|i| i.id == id))
    }

    async fn lines(
        &self,
        _ctx: &TenantContext,
        _invoice_id: Uuid,
    ) -> Result<Vec<crate::models::InvoiceLine>> {
        Ok(Vec::new())
    }

    async fn create_cycle(
        &self,
        ctx: &TenantContext,
        cycle: NewInvoiceCycle,
    ) -> Result<(Invoice, bool)> {
        let invoice = invoice_from_cycle(ctx.tenant_id, &cycle);
        self.created_cycles.lock().unwrap().push(cycle);
        *self.invoice.lock().unwrap() = Some(invoice.clone());
        Ok((invoice, true))
    }

    async fn latest_attempt_number(&self, _ctx: &TenantContext, _invoice_id: Uuid) -> Result<i32> {
        Ok(self.attempts.lock().unwrap().len() as i32)
    }

    async fn attempts(
        &self,
        _ctx: &TenantContext,
        _invoice_id: Uuid,
    ) -> Result<Vec<PaymentAttempt>> {
        Ok(Vec::new())
    }

    async fn insert_attempt(
        &self,
        _ctx: &TenantContext,
        attempt: NewPaymentAttempt,
    ) -> Result<PaymentAttempt> {
        let row = PaymentAttempt {
            id: Uuid::new_v4(),
            invoice_id: attempt.invoice_id,
            amount_cents: attempt.amount_cents,
            currency: attempt.currency,
            status: PaymentAttemptStatus::Pending,
            payment_method_ref: attempt.payment_method_ref.clone(),
            external_payment_id: None,
            failure_code: None,
            failure_reason: None,
            attempt_number: attempt.attempt_number,
            attempted_at: Utc::now(),
            completed_at: None,
        };
        self.attempts.lock().unwrap().push(attempt);
        Ok(row)
    }

    async fn mark_paid(
        &self,
        _ctx: &TenantContext,
        invoice_id: Uuid,
        _attempt_id: Uuid,
        _external_payment_id: Option<String>,
        fanout_tasks: Vec<NewTask>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Invoice> {
        self.paid_calls
            .lock()
            .unwrap()
            .push((invoice_id, fanout_tasks, events));
        let mut invoice = self.invoice.lock().unwrap().clone().unwrap();
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(Utc::now());
        Ok(invoice)
    }

    async fn mark_attempt_failed(
        &self,
        _ctx: &TenantContext,
        attempt_id: Uuid,
        _failure_code: Option<String>,
        _failure_reason: Option<String>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<()> {
        self.failed_calls.lock().unwrap().push((attempt_id, events));
        Ok(())
    }
}

// --- Fixtures ---

fn snapshot(plan_type: PlanType) -> PlanSnapshot {
    PlanSnapshot {
        plan_id: Uuid::new_v4(),
        plan_name: "Monthly Box".to_string(),
        base_price_cents: 2999,
        currency: Currency::USD,
        billing_interval: BillingInterval::Monthly,
        billing_interval_count: 1,
        trial_period_days: 0,
        plan_type,
    }
}

fn test_subscription(
    tenant_id: Uuid,
    plan_type: PlanType,
    status: SubscriptionStatus,
    with_address: bool,
) -> Subscription {
    let now = Utc::now();
    let period_start = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
    let period_end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let snap = snapshot(plan_type);
    Subscription {
        id: Uuid::new_v4(),
        tenant_id,
        customer_id: Uuid::new_v4(),
        plan_id: snap.plan_id,
        status,
        current_period_start: period_start,
        current_period_end: period_end,
        next_renewal_at: period_end,
        trial_start: None,
        trial_end: None,
        payment_method_ref: "pm_card_visa".to_string(),
        shipping_address: with_address.then(|| {
            sqlx::types::Json(crate::models::ShippingAddress {
                line1: "1 Main St".to_string(),
                line2: None,
                city: "Springfield".to_string(),
                state: None,
                postal_code: "12345".to_string(),
                country: "US".to_string(),
                recipient: None,
            })
        }),
        plan_snapshot: sqlx::types::Json(snap),
        cancel_at_period_end: false,
        canceled_at: None,
        cancellation_reason: None,
        created_at: now,
        updated_at: now,
    }
}

fn test_item(subscription: &Subscription, quantity: i32) -> SubscriptionItem {
    test_item_priced(subscription, quantity, 2999)
}

fn test_item_priced(
    subscription: &Subscription,
    quantity: i32,
    unit_price_cents: i64,
) -> SubscriptionItem {
    let now = Utc::now();
    SubscriptionItem {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        plan_id: subscription.plan_id,
        product_id: Uuid::new_v4(),
        quantity,
        unit_price_cents,
        currency: Currency::USD,
        item_config: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

fn open_invoice(subscription: &Subscription, total_cents: i64) -> Invoice {
    let now = Utc::now();
    Invoice {
        id: Uuid::new_v4(),
        tenant_id: subscription.tenant_id,
        subscription_id: subscription.id,
        customer_id: subscription.customer_id,
        invoice_number: "INV-20250101-abcd1234".to_string(),
        period_start: subscription.current_period_end,
        period_end: BillingInterval::Monthly.advance(subscription.current_period_end, 1),
        subtotal_cents: total_cents,
        tax_cents: 0,
        total_cents,
        currency: Currency::USD,
        status: InvoiceStatus::Open,
        due_date: now,
        paid_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn service(
    subscriptions: Arc<MockSubscriptionRepository>,
    invoices: Arc<MockInvoiceRepository>,
    provider: Arc<SandboxPaymentProvider>,
) -> BillingService {
    BillingService::new(
        subscriptions,
        invoices,
        provider,
        crate::config::TaskConfig::default(),
        crate::config::PaymentConfig::default(),
    )
}

// --- Renewal ---

#[tokio::test]
async fn test_renewal_creates_invoice_for_next_period() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    let item = test_item(&subscription, 1);
    let subs = Arc::new(MockSubscriptionRepository::with(
        subscription.clone(),
        vec![item.clone()],
    ));
    let invoices = Arc::new(MockInvoiceRepository::default());
    let billing = service(subs.clone(), invoices.clone(), Arc::new(SandboxPaymentProvider::new()));

    let ctx = TenantContext::system(tenant_id);
    let invoice = billing
        .renew_product(&ctx, subscription.id, item.id)
        .await
        .unwrap()
        .unwrap();

    // Period starts where the current one ends and spans one month
    assert_eq!(invoice.period_start, subscription.current_period_end);
    assert_eq!(
        invoice.period_end,
        Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(invoice.total_cents, 2999);
    assert_eq!(invoice.status, InvoiceStatus::Open);

    let cycles = invoices.created_cycles.lock().unwrap();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].lines.len(), 1);

    // Renewal was audited
    let history = subs.history.lock().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "renewed");
}

#[tokio::test]
async fn test_item_trigger_bills_whole_contract() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    let item_a = test_item_priced(&subscription, 1, 2999);
    let item_b = test_item_priced(&subscription, 2, 1499);

    let subs = Arc::new(MockSubscriptionRepository::with(
        subscription.clone(),
        vec![item_a.clone(), item_b.clone()],
    ));
    let invoices = Arc::new(MockInvoiceRepository::default());
    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    let invoice = billing
        .renew_product(&ctx, subscription.id, item_a.id)
        .await
        .unwrap()
        .unwrap();

    // Both items billed, not just the triggering one
    assert_eq!(invoice.total_cents, 2999 + 2 * 1499);
    {
        let cycles = invoices.created_cycles.lock().unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].lines.len(), 2);
    }

    // The other item's trigger converges on the same invoice
    *invoices.existing_by_period.lock().unwrap() = Some(invoice.clone());
    let again = billing
        .renew_product(&ctx, subscription.id, item_b.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, invoice.id);
    assert_eq!(invoices.created_cycles.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_renewal_reuses_existing_invoice() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    let item = test_item(&subscription, 1);
    let existing = open_invoice(&subscription, 2999);

    let subs = Arc::new(MockSubscriptionRepository::with(
        subscription.clone(),
        vec![item.clone()],
    ));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.existing_by_period.lock().unwrap() = Some(existing.clone());

    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    let invoice = billing
        .renew_product(&ctx, subscription.id, item.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(invoice.id, existing.id);
    assert!(invoices.created_cycles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_renewal_skips_non_active_subscription() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Paused, true);
    let item = test_item(&subscription, 1);
    let subs = Arc::new(MockSubscriptionRepository::with(
        subscription.clone(),
        vec![item.clone()],
    ));
    let invoices = Arc::new(MockInvoiceRepository::default());
    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));

    let ctx = TenantContext::system(tenant_id);
    let result = billing
        .renew_product(&ctx, subscription.id, item.id)
        .await
        .unwrap();

    assert!(result.is_none());
    assert!(invoices.created_cycles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_renewal_of_unknown_subscription_is_not_found() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    let billing = service(subs, invoices, Arc::new(SandboxPaymentProvider::new()));

    let ctx = TenantContext::system(tenant_id);
    let err = billing
        .renew_product(&ctx, Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// --- Collection ---

#[tokio::test]
async fn test_charge_on_paid_invoice_is_noop() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    let mut invoice = open_invoice(&subscription, 2999);
    invoice.status = InvoiceStatus::Paid;

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    let outcome = billing.charge_payment(&ctx, invoice.id, false).await.unwrap();
    assert!(matches!(outcome, ChargeOutcome::AlreadyPaid));
    assert!(invoices.attempts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_charge_success_schedules_fanout() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    let invoice = open_invoice(&subscription, 2999);

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    let outcome = billing.charge_payment(&ctx, invoice.id, false).await.unwrap();
    let ChargeOutcome::Paid(paid) = outcome else {
        panic!("expected Paid outcome");
    };
    assert_eq!(paid.status, InvoiceStatus::Paid);

    let paid_calls = invoices.paid_calls.lock().unwrap();
    assert_eq!(paid_calls.len(), 1);

    let (_, tasks, events) = &paid_calls[0];
    let task_keys: Vec<&str> = tasks.iter().map(|t| t.task_key.as_str()).collect();
    assert!(task_keys.contains(&format!("delivery_{}", invoice.id).as_str()));
    assert!(task_keys.contains(&format!("entitlement_{}", invoice.id).as_str()));

    let event_types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(event_types.contains(&"invoice.paid"));
    assert!(event_types.contains(&"payment.succeeded"));
}

#[tokio::test]
async fn test_charge_digital_plan_skips_delivery() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Digital, SubscriptionStatus::Active, false);
    let invoice = open_invoice(&subscription, 2999);

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    billing.charge_payment(&ctx, invoice.id, false).await.unwrap();

    let paid_calls = invoices.paid_calls.lock().unwrap();
    let (_, tasks, _) = &paid_calls[0];
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_key, format!("entitlement_{}", invoice.id));
}

#[tokio::test]
async fn test_charge_failure_returns_transient_and_emits_failed() {
    let tenant_id = Uuid::new_v4();
    let mut subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    subscription.payment_method_ref = "pm_decline".to_string();
    let invoice = open_invoice(&subscription, 2999);

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    let outcome = billing.charge_payment(&ctx, invoice.id, false).await.unwrap();
    assert!(matches!(outcome, ChargeOutcome::Failed(_)));

    let failed = invoices.failed_calls.lock().unwrap();
    assert_eq!(failed.len(), 1);
    let event_types: Vec<&str> = failed[0].1.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(event_types, vec!["payment.failed"]);
}

#[tokio::test]
async fn test_final_attempt_failure_emits_exhausted() {
    let tenant_id = Uuid::new_v4();
    let mut subscription =
        test_subscription(tenant_id, PlanType::Hybrid, SubscriptionStatus::Active, true);
    subscription.payment_method_ref = "pm_decline".to_string();
    let invoice = open_invoice(&subscription, 2999);

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices.clone(), Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    billing.charge_payment(&ctx, invoice.id, true).await.unwrap();

    let failed = invoices.failed_calls.lock().unwrap();
    let event_types: Vec<&str> = failed[0].1.iter().map(|e| e.event_type.as_str()).collect();
    assert!(event_types.contains(&"payment.failed"));
    assert!(event_types.contains(&"payment.exhausted"));
    assert!(event_types.contains(&"subscription.payment_exhausted"));
}

#[tokio::test]
async fn test_retry_then_success_inserts_two_attempts() {
    let tenant_id = Uuid::new_v4();
    let subscription =
        test_subscription(tenant_id, PlanType::Digital, SubscriptionStatus::Active, false);
    let invoice = open_invoice(&subscription, 2999);

    let provider = Arc::new(SandboxPaymentProvider::new());
    provider.fail_next(invoice.id, 1);

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices.clone(), provider);
    let ctx = TenantContext::system(tenant_id);

    let first = billing.charge_payment(&ctx, invoice.id, false).await.unwrap();
    assert!(matches!(first, ChargeOutcome::Failed(_)));

    let second = billing.charge_payment(&ctx, invoice.id, false).await.unwrap();
    assert!(matches!(second, ChargeOutcome::Paid(_)));

    let attempts = invoices.attempts.lock().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[1].attempt_number, 2);

    // Exactly one fan-out, after the successful attempt
    assert_eq!(invoices.paid_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_provider_timeout_surfaces_as_transient() {
    let tenant_id = Uuid::new_v4();
    let mut subscription =
        test_subscription(tenant_id, PlanType::Digital, SubscriptionStatus::Active, false);
    subscription.payment_method_ref = "pm_timeout".to_string();
    let invoice = open_invoice(&subscription, 2999);

    let subs = Arc::new(MockSubscriptionRepository::with(subscription, vec![]));
    let invoices = Arc::new(MockInvoiceRepository::default());
    *invoices.invoice.lock().unwrap() = Some(invoice.clone());

    let billing = service(subs, invoices, Arc::new(SandboxPaymentProvider::new()));
    let ctx = TenantContext::system(tenant_id);

    let err = billing.charge_payment(&ctx, invoice.id, false).await.unwrap_err();
    assert!(err.is_transient());
}
