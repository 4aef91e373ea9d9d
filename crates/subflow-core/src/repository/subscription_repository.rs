//! Subscription repository
//!
//! Database operations for the contract aggregate: subscriptions, their
//! items, and the append-only history trail. Lifecycle transitions commit
//! the row update, the audit row and the outbox event in one transaction.
//!
//! Cross-tenant scans exist only for the renewal sweeper and are named
//! `*_all_tenants`; callers re-bind a per-row tenant context before doing
//! any tenant-scoped work with the results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::{
    CancellationReason, NewOutboxEvent, NewTask, PlanSnapshot, ShippingAddress, Subscription,
    SubscriptionHistory, SubscriptionItem, SubscriptionStatus,
};
use crate::outbox;
use crate::repository::task_repository;
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// New subscription row, computed by the lifecycle service
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_renewal_at: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub payment_method_ref: String,
    pub shipping_address: Option<ShippingAddress>,
    pub plan_snapshot: PlanSnapshot,
}

/// New subscription item row
#[derive(Debug, Clone)]
pub struct NewSubscriptionItem {
    pub plan_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub currency: crate::models::Currency,
    pub item_config: serde_json::Value,
}

/// Audit entry written alongside a state change
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub action: String,
    pub metadata: serde_json::Value,
}

/// Status transition parameters; the service validates the state machine,
/// the repository enforces it again with an expected-status guard
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub expected: SubscriptionStatus,
    pub new_status: SubscriptionStatus,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<CancellationReason>,
    pub clear_cancel_at_period_end: bool,
}

impl StatusChange {
    pub fn simple(expected: SubscriptionStatus, new_status: SubscriptionStatus) -> Self {
        Self {
            expected,
            new_status,
            canceled_at: None,
            cancellation_reason: None,
            clear_cancel_at_period_end: false,
        }
    }
}

/// Mutable contract fields touched by `modify`
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub plan_id: Option<Uuid>,
    pub payment_method_ref: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
}

/// Subscription repository trait
#[async_trait]
pub trait SubscriptionRepository: Send + Sync + 'static {
    /// Create a subscription with its items, the audit row, the outbox event
    /// and an optional first task (trial end or first renewal), atomically
    async fn create(
        &self,
        ctx: &TenantContext,
        subscription: NewSubscription,
        items: Vec<NewSubscriptionItem>,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
        initial_task: Option<NewTask>,
    ) -> Result<Subscription>;

    /// Find a subscription by ID
    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Subscription>>;

    /// List a subscription's items
    async fn items(&self, ctx: &TenantContext, subscription_id: Uuid) -> Result<Vec<SubscriptionItem>>;

    /// Find one item of a subscription
    async fn find_item(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        item_id: Uuid,
    ) -> Result<Option<SubscriptionItem>>;

    /// Apply a status transition with audit row and outbox event.
    ///
    /// Returns `None` when the row was not in the expected status (lost a
    /// race); callers surface that as a conflict.
    async fn update_status(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        change: StatusChange,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> Result<Option<Subscription>>;

    /// Flag a subscription for deferred cancellation at period end
    async fn set_cancel_at_period_end(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        reason: CancellationReason,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> Result<Option<Subscription>>;

    /// Update mutable contract fields, optionally replacing the item set,
    /// with audit row and outbox event
    async fn modify(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        update: SubscriptionUpdate,
        replace_items: Option<Vec<NewSubscriptionItem>>,
        new_snapshot: Option<PlanSnapshot>,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> Result<Option<Subscription>>;

    /// Append an audit row outside a transition (renewals)
    async fn append_history(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        entry: NewHistoryEntry,
    ) -> Result<()>;

    /// List history, newest first
    async fn history(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>>;

    // Sweeper scans, across tenants, keyset-paginated by (next_renewal_at, id)

    /// Active subscriptions due for renewal
    async fn find_due_for_renewal_all_tenants(
        &self,
        cursor: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<Subscription>>;

    /// Trialing subscriptions whose trial has ended
    async fn find_due_trials_all_tenants(&self, limit: i64) -> Result<Vec<Subscription>>;

    /// Active subscriptions flagged cancel-at-period-end whose period lapsed
    async fn find_period_end_cancellations_all_tenants(&self, limit: i64)
        -> Result<Vec<Subscription>>;

    /// Active subscriptions whose period lapsed without the renewal rolling
    /// it forward (renewal failed terminally); candidates for expiry
    async fn find_expiry_candidates_all_tenants(
        &self,
        grace: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<Subscription>>;
}

/// Roll the billing period forward on an open transaction. Part of the
/// invoice-creation flow.
///
/// The `current_period_end = $3` guard pins the roll to the cycle being
/// invoiced: the new period must start exactly where the stored period ends
/// (the trial boundary included, since a trial's period ends at trial_end).
/// Zero rows means another transaction already rolled the contract past
/// this cycle; the caller's transaction aborts, taking its invoice with it.
pub(crate) async fn advance_period_on(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    subscription_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET current_period_start = $3,
            current_period_end = $4,
            next_renewal_at = $4,
            updated_at = NOW()
        WHERE tenant_id = $1 AND id = $2 AND current_period_end = $3
        "#,
    )
    .bind(tenant_id)
    .bind(subscription_id)
    .bind(period_start)
    .bind(period_end)
    .execute(conn)
    .await
    .map_err(Error::Database)?;

    if result.rows_affected() == 0 {
        return Err(Error::conflict(
            "Billing period was rolled concurrently; rerun the renewal",
        ));
    }

    Ok(())
}

async fn insert_history_on(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    ctx: &TenantContext,
    entry: &NewHistoryEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO subscription_history (
            subscription_id, action, performed_by, performed_by_type, metadata
        ) VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(subscription_id)
    .bind(&entry.action)
    .bind(ctx.actor())
    .bind(ctx.actor_type())
    .bind(&entry.metadata)
    .execute(conn)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

async fn insert_items_on(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    items: &[NewSubscriptionItem],
) -> Result<()> {
    for item in items {
        sqlx::query(
            r#"
            INSERT INTO subscription_items (
                subscription_id, plan_id, product_id, quantity,
                unit_price_cents, currency, item_config
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(subscription_id)
        .bind(item.plan_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(item.unit_price_cents)
        .bind(item.currency)
        .bind(&item.item_config)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;
    }
    Ok(())
}

/// PostgreSQL implementation of the subscription repository
#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: sqlx::PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn create(
        &self,
        ctx: &TenantContext,
        subscription: NewSubscription,
        items: Vec<NewSubscriptionItem>,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
        initial_task: Option<NewTask>,
    ) -> Result<Subscription> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let created = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                tenant_id, customer_id, plan_id, status,
                current_period_start, current_period_end, next_renewal_at,
                trial_start, trial_end, payment_method_ref,
                shipping_address, plan_snapshot
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription.customer_id)
        .bind(subscription.plan_id)
        .bind(subscription.status)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.next_renewal_at)
        .bind(subscription.trial_start)
        .bind(subscription.trial_end)
        .bind(&subscription.payment_method_ref)
        .bind(subscription.shipping_address.as_ref().map(sqlx::types::Json))
        .bind(sqlx::types::Json(&subscription.plan_snapshot))
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        insert_items_on(&mut tx, created.id, &items).await?;
        insert_history_on(&mut tx, created.id, ctx, &history).await?;
        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;

        if let Some(task) = initial_task {
            task_repository::enqueue_on(&mut tx, ctx.tenant_id, &task).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(created)
    }

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(subscription)
    }

    async fn items(&self, ctx: &TenantContext, subscription_id: Uuid) -> Result<Vec<SubscriptionItem>> {
        let items = sqlx::query_as::<_, SubscriptionItem>(
            r#"
            SELECT i.* FROM subscription_items i
            JOIN subscriptions s ON s.id = i.subscription_id
            WHERE s.tenant_id = $1 AND i.subscription_id = $2
            ORDER BY i.created_at
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(items)
    }

    async fn find_item(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        item_id: Uuid,
    ) -> Result<Option<SubscriptionItem>> {
        let item = sqlx::query_as::<_, SubscriptionItem>(
            r#"
            SELECT i.* FROM subscription_items i
            JOIN subscriptions s ON s.id = i.subscription_id
            WHERE s.tenant_id = $1 AND i.subscription_id = $2 AND i.id = $3
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(item)
    }

    async fn update_status(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        change: StatusChange,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> Result<Option<Subscription>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = $4,
                canceled_at = COALESCE($5, canceled_at),
                cancellation_reason = COALESCE($6, cancellation_reason),
                cancel_at_period_end = CASE WHEN $7 THEN FALSE ELSE cancel_at_period_end END,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status = $3
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(change.expected)
        .bind(change.new_status)
        .bind(change.canceled_at)
        .bind(change.cancellation_reason)
        .bind(change.clear_cancel_at_period_end)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        insert_history_on(&mut tx, id, ctx, &history).await?;
        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(updated))
    }

    async fn set_cancel_at_period_end(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        reason: CancellationReason,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> Result<Option<Subscription>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = TRUE,
                cancellation_reason = $3,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status IN ('trialing', 'active', 'paused')
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        insert_history_on(&mut tx, id, ctx, &history).await?;
        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(updated))
    }

    async fn modify(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        update: SubscriptionUpdate,
        replace_items: Option<Vec<NewSubscriptionItem>>,
        new_snapshot: Option<PlanSnapshot>,
        history: NewHistoryEntry,
        event: NewOutboxEvent,
    ) -> Result<Option<Subscription>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET plan_id = COALESCE($3, plan_id),
                payment_method_ref = COALESCE($4, payment_method_ref),
                shipping_address = COALESCE($5, shipping_address),
                plan_snapshot = COALESCE($6, plan_snapshot),
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status IN ('trialing', 'active', 'paused')
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(update.plan_id)
        .bind(update.payment_method_ref)
        .bind(update.shipping_address.as_ref().map(sqlx::types::Json))
        .bind(new_snapshot.as_ref().map(sqlx::types::Json))
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        if let Some(items) = replace_items {
            sqlx::query("DELETE FROM subscription_items WHERE subscription_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            insert_items_on(&mut tx, id, &items).await?;
        }

        insert_history_on(&mut tx, id, ctx, &history).await?;
        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(updated))
    }

    async fn append_history(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        entry: NewHistoryEntry,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        insert_history_on(&mut conn, subscription_id, ctx, &entry).await
    }

    async fn history(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>> {
        let rows = sqlx::query_as::<_, SubscriptionHistory>(
            r#"
            SELECT h.* FROM subscription_history h
            JOIN subscriptions s ON s.id = h.subscription_id
            WHERE s.tenant_id = $1 AND h.subscription_id = $2
            ORDER BY h.performed_at DESC
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows)
    }

    async fn find_due_for_renewal_all_tenants(
        &self,
        cursor: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<Subscription>> {
        let (cursor_at, cursor_id) = match cursor {
            Some((at, id)) => (Some(at), Some(id)),
            None => (None, None),
        };

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active'
              AND next_renewal_at <= NOW()
              AND NOT (cancel_at_period_end AND current_period_end <= NOW())
              AND ($1::timestamptz IS NULL OR (next_renewal_at, id) > ($1, $2::uuid))
            ORDER BY next_renewal_at, id
            LIMIT $3
            "#,
        )
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(subscriptions)
    }

    async fn find_due_trials_all_tenants(&self, limit: i64) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'trialing' AND trial_end IS NOT NULL AND trial_end <= NOW()
            ORDER BY trial_end
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(subscriptions)
    }

    async fn find_period_end_cancellations_all_tenants(
        &self,
        limit: i64,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active'
              AND cancel_at_period_end
              AND current_period_end <= NOW()
            ORDER BY current_period_end
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(subscriptions)
    }

    async fn find_expiry_candidates_all_tenants(
        &self,
        grace: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<Subscription>> {
        // A healthy renewal rolls next_renewal_at past the old period end;
        // a contract stuck at next_renewal_at <= current_period_end past the
        // grace window never renewed.
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active'
              AND NOT cancel_at_period_end
              AND current_period_end <= NOW() - make_interval(secs => $1)
              AND next_renewal_at <= current_period_end
            ORDER BY current_period_end
            LIMIT $2
            "#,
        )
        .bind(grace.num_seconds() as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(subscriptions)
    }
}
