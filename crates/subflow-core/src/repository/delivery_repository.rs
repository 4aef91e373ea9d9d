//! Delivery instance repository
//!
//! Creation is convergent: the cycle-key unique constraint plus
//! ON CONFLICT DO NOTHING means however many duplicate tasks run, exactly one
//! row exists and only its creator enqueues the order task.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    DeliveryInstance, DeliverySnapshot, NewOutboxEvent, NewTask, TaskType,
};
use crate::outbox;
use crate::repository::task_repository;
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// New delivery instance row
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub cycle_key: String,
    pub snapshot: DeliverySnapshot,
    pub order_task_max_attempts: i32,
}

/// Delivery repository trait
#[async_trait]
pub trait DeliveryRepository: Send + Sync + 'static {
    /// Insert the delivery for a cycle, or converge on the existing row.
    ///
    /// A fresh insert also enqueues the create_order task and emits
    /// `delivery.scheduled`, in the same transaction. Returns
    /// `(row, created)`.
    async fn create(
        &self,
        ctx: &TenantContext,
        delivery: NewDelivery,
        scheduled_event_payload: serde_json::Value,
    ) -> Result<(DeliveryInstance, bool)>;

    /// Find a delivery by ID
    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<DeliveryInstance>>;

    /// Find the delivery created for an invoice
    async fn find_by_invoice(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Option<DeliveryInstance>>;

    /// List deliveries for a subscription, newest first
    async fn list_by_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<DeliveryInstance>>;

    /// Record the external order: pending -> order_created plus event.
    /// Returns `None` when the delivery was not pending.
    async fn set_order_created(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        external_order_ref: &str,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>>;

    /// Cancel a delivery that is still pending with no external order.
    ///
    /// Also cancels the still-ready create_order task for it. Returns `None`
    /// when the delivery is past its cancellable window.
    async fn cancel(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        reason: &str,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>>;

    /// order_created -> shipped plus event
    async fn mark_shipped(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>>;

    /// shipped -> delivered plus event
    async fn mark_delivered(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>>;
}

/// PostgreSQL implementation of the delivery repository
#[derive(Clone)]
pub struct PostgresDeliveryRepository {
    pool: sqlx::PgPool,
}

impl PostgresDeliveryRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn transition(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        from: &str,
        to: &str,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query_as::<_, DeliveryInstance>(
            r#"
            UPDATE delivery_instances
            SET status = $4::delivery_status, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status = $3::delivery_status
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(updated))
    }
}

#[async_trait]
impl DeliveryRepository for PostgresDeliveryRepository {
    async fn create(
        &self,
        ctx: &TenantContext,
        delivery: NewDelivery,
        scheduled_event_payload: serde_json::Value,
    ) -> Result<(DeliveryInstance, bool)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted = sqlx::query_as::<_, DeliveryInstance>(
            r#"
            INSERT INTO delivery_instances (
                tenant_id, subscription_id, invoice_id, cycle_key, status, snapshot
            ) VALUES ($1, $2, $3, $4, 'pending', $5)
            ON CONFLICT (tenant_id, subscription_id, cycle_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(delivery.subscription_id)
        .bind(delivery.invoice_id)
        .bind(&delivery.cycle_key)
        .bind(sqlx::types::Json(&delivery.snapshot))
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(created) = inserted else {
            // Duplicate task run; the first creator already scheduled the
            // order task and emitted the event.
            tx.rollback().await.map_err(Error::Database)?;
            let existing = sqlx::query_as::<_, DeliveryInstance>(
                r#"
                SELECT * FROM delivery_instances
                WHERE tenant_id = $1 AND subscription_id = $2 AND cycle_key = $3
                "#,
            )
            .bind(ctx.tenant_id)
            .bind(delivery.subscription_id)
            .bind(&delivery.cycle_key)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
            return Ok((existing, false));
        };

        let order_task = NewTask::new(
            TaskType::CreateOrder,
            crate::models::task_key::create_order(created.id),
            Utc::now(),
            delivery.order_task_max_attempts,
            serde_json::to_value(crate::models::task_payload::CreateOrder {
                delivery_id: created.id,
            })?,
        );
        task_repository::enqueue_on(&mut tx, ctx.tenant_id, &order_task).await?;

        outbox::emit(
            &mut tx,
            ctx.tenant_id,
            &NewOutboxEvent::new(
                crate::models::event_type::DELIVERY_SCHEDULED,
                scheduled_event_payload,
            )
            .with_key(format!("delivery_scheduled_{}", created.id)),
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;

        Ok((created, true))
    }

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<DeliveryInstance>> {
        let delivery = sqlx::query_as::<_, DeliveryInstance>(
            "SELECT * FROM delivery_instances WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(delivery)
    }

    async fn find_by_invoice(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Option<DeliveryInstance>> {
        let delivery = sqlx::query_as::<_, DeliveryInstance>(
            "SELECT * FROM delivery_instances WHERE tenant_id = $1 AND invoice_id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(delivery)
    }

    async fn list_by_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<DeliveryInstance>> {
        let deliveries = sqlx::query_as::<_, DeliveryInstance>(
            r#"
            SELECT * FROM delivery_instances
            WHERE tenant_id = $1 AND subscription_id = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(deliveries)
    }

    async fn set_order_created(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        external_order_ref: &str,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query_as::<_, DeliveryInstance>(
            r#"
            UPDATE delivery_instances
            SET status = 'order_created', external_order_ref = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(external_order_ref)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(updated))
    }

    async fn cancel(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        reason: &str,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let updated = sqlx::query_as::<_, DeliveryInstance>(
            r#"
            UPDATE delivery_instances
            SET status = 'canceled',
                cancellation_reason = $3,
                canceled_at = NOW(),
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
              AND status = 'pending' AND external_order_ref IS NULL
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

        task_repository::cancel_if_ready_on(
            &mut tx,
            ctx.tenant_id,
            &crate::models::task_key::create_order(id),
        )
        .await?;

        outbox::emit(&mut tx, ctx.tenant_id, &event).await?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(Some(updated))
    }

    async fn mark_shipped(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>> {
        self.transition(ctx, id, "order_created", "shipped", event).await
    }

    async fn mark_delivered(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        event: NewOutboxEvent,
    ) -> Result<Option<DeliveryInstance>> {
        self.transition(ctx, id, "shipped", "delivered", event).await
    }
}
