//! Webhook endpoint and delivery repository

use async_trait::async_trait;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::{WebhookDelivery, WebhookEndpoint};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// New endpoint registration
#[derive(Debug, Clone)]
pub struct NewWebhookEndpoint {
    pub url: String,
    pub secret: String,
    pub subscribed_event_types: Vec<String>,
}

/// A due delivery joined with everything the dispatcher needs to POST it
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryDispatch {
    pub delivery_id: Uuid,
    pub tenant_id: Uuid,
    pub endpoint_id: Uuid,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub url: String,
    pub secret: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub event_payload: serde_json::Value,
    pub event_created_at: chrono::DateTime<chrono::Utc>,
}

/// Webhook repository trait
#[async_trait]
pub trait WebhookRepository: Send + Sync + 'static {
    /// Register an endpoint
    async fn register(&self, ctx: &TenantContext, endpoint: NewWebhookEndpoint)
        -> Result<WebhookEndpoint>;

    /// Find an endpoint
    async fn find_endpoint(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<WebhookEndpoint>>;

    /// List a tenant's endpoints
    async fn list_endpoints(&self, ctx: &TenantContext) -> Result<Vec<WebhookEndpoint>>;

    /// Update an endpoint's URL and/or subscriptions
    async fn update_endpoint(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        url: Option<String>,
        subscribed_event_types: Option<Vec<String>>,
    ) -> Result<Option<WebhookEndpoint>>;

    /// Disable an endpoint. Delivery rows keep their history, so removal is
    /// by status.
    async fn disable_endpoint(&self, ctx: &TenantContext, id: Uuid) -> Result<bool>;

    /// Active endpoints of one tenant subscribed to an event type. Called by
    /// the fan-out loop with the event row's tenant.
    async fn active_endpoints_for_event(
        &self,
        tenant_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>>;

    /// Due pending deliveries joined with endpoint and event, FIFO, across
    /// tenants
    async fn due_deliveries(&self, limit: i64) -> Result<Vec<DeliveryDispatch>>;

    /// Record a 2xx response
    async fn record_success(&self, delivery_id: Uuid, response_status: i32) -> Result<()>;

    /// Record a failed attempt; backs off exponentially and flips to failed
    /// once the budget is exhausted
    async fn record_failure(
        &self,
        delivery_id: Uuid,
        response_status: Option<i32>,
        response_body: Option<String>,
        error: Option<String>,
        backoff_base_seconds: u64,
    ) -> Result<()>;

    /// Deliveries created for one outbox event
    async fn deliveries_for_event(
        &self,
        ctx: &TenantContext,
        outbox_event_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>>;
}

/// PostgreSQL implementation of the webhook repository
#[derive(Clone)]
pub struct PostgresWebhookRepository {
    pool: sqlx::PgPool,
}

impl PostgresWebhookRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepository for PostgresWebhookRepository {
    async fn register(
        &self,
        ctx: &TenantContext,
        endpoint: NewWebhookEndpoint,
    ) -> Result<WebhookEndpoint> {
        let row = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            INSERT INTO webhook_endpoints (tenant_id, url, secret, subscribed_event_types)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(&endpoint.subscribed_event_types)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row)
    }

    async fn find_endpoint(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<WebhookEndpoint>> {
        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(endpoint)
    }

    async fn list_endpoints(&self, ctx: &TenantContext) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(endpoints)
    }

    async fn update_endpoint(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        url: Option<String>,
        subscribed_event_types: Option<Vec<String>>,
    ) -> Result<Option<WebhookEndpoint>> {
        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            UPDATE webhook_endpoints
            SET url = COALESCE($3, url),
                subscribed_event_types = COALESCE($4, subscribed_event_types),
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(url)
        .bind(subscribed_event_types)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(endpoint)
    }

    async fn disable_endpoint(&self, ctx: &TenantContext, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_endpoints
            SET status = 'disabled', updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status = 'active'
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_endpoints_for_event(
        &self,
        tenant_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT * FROM webhook_endpoints
            WHERE tenant_id = $1
              AND status = 'active'
              AND ($2 = ANY(subscribed_event_types) OR '*' = ANY(subscribed_event_types))
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(endpoints)
    }

    async fn due_deliveries(&self, limit: i64) -> Result<Vec<DeliveryDispatch>> {
        let deliveries = sqlx::query_as::<_, DeliveryDispatch>(
            r#"
            SELECT
                d.id AS delivery_id,
                d.tenant_id,
                d.endpoint_id,
                d.attempt_count,
                d.max_attempts,
                e.url,
                e.secret,
                o.id AS event_id,
                o.event_type,
                o.event_payload,
                o.created_at AS event_created_at
            FROM webhook_deliveries d
            JOIN webhook_endpoints e ON e.id = d.endpoint_id
            JOIN outbox_events o ON o.id = d.outbox_event_id
            WHERE d.status = 'pending'
              AND d.next_attempt_at <= NOW()
              AND d.attempt_count < d.max_attempts
              AND e.status = 'active'
            ORDER BY d.created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(deliveries)
    }

    async fn record_success(&self, delivery_id: Uuid, response_status: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivered',
                attempt_count = attempt_count + 1,
                last_response_status = $2,
                delivered_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(delivery_id)
        .bind(response_status)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn record_failure(
        &self,
        delivery_id: Uuid,
        response_status: Option<i32>,
        response_body: Option<String>,
        error: Option<String>,
        backoff_base_seconds: u64,
    ) -> Result<()> {
        // next_attempt_at = now + base * 2^attempt_count, where attempt_count
        // already includes the attempt being recorded
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempt_count = attempt_count + 1,
                last_response_status = $2,
                last_response_body = $3,
                last_error = $4,
                next_attempt_at = NOW() + make_interval(secs => $5 * POWER(2, attempt_count + 1)),
                status = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN 'failed'::webhook_delivery_status
                    ELSE 'pending'::webhook_delivery_status
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(delivery_id)
        .bind(response_status)
        .bind(response_body)
        .bind(error)
        .bind(backoff_base_seconds as f64)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn deliveries_for_event(
        &self,
        ctx: &TenantContext,
        outbox_event_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>> {
        let deliveries = sqlx::query_as::<_, WebhookDelivery>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE tenant_id = $1 AND outbox_event_id = $2
            ORDER BY created_at
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(outbox_event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(deliveries)
    }
}
