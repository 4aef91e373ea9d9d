//! Outbox repository: the relay's read side
//!
//! Emission happens inside producer transactions (see `crate::outbox`); this
//! repository only serves the fan-out loop.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::OutboxEvent;
use crate::{Error, Result};

/// One delivery row to create during fan-out
#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub endpoint_id: Uuid,
    pub max_attempts: i32,
}

/// Outbox repository trait
#[async_trait]
pub trait OutboxRepository: Send + Sync + 'static {
    /// Oldest unpublished events, FIFO, across tenants
    async fn fetch_unpublished(&self, limit: i64) -> Result<Vec<OutboxEvent>>;

    /// Mark an event published and insert its delivery rows in one
    /// transaction. Zero deliveries still publishes.
    async fn publish(
        &self,
        event: &OutboxEvent,
        deliveries: Vec<NewWebhookDelivery>,
    ) -> Result<()>;
}

/// PostgreSQL implementation of the outbox repository
#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: sqlx::PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn fetch_unpublished(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT * FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(events)
    }

    async fn publish(
        &self,
        event: &OutboxEvent,
        deliveries: Vec<NewWebhookDelivery>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        for delivery in &deliveries {
            sqlx::query(
                r#"
                INSERT INTO webhook_deliveries (
                    tenant_id, endpoint_id, outbox_event_id, status,
                    attempt_count, max_attempts, next_attempt_at
                ) VALUES ($1, $2, $3, 'pending', 0, $4, NOW())
                "#,
            )
            .bind(event.tenant_id)
            .bind(delivery.endpoint_id)
            .bind(event.id)
            .bind(delivery.max_attempts)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        let result = sqlx::query(
            "UPDATE outbox_events SET published_at = NOW() WHERE id = $1 AND published_at IS NULL",
        )
        .bind(event.id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            // A concurrent relay pass already published this event; drop our
            // duplicate delivery rows with the rollback.
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(());
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(())
    }
}
