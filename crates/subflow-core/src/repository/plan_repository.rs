//! Plan repository

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{CreatePlanRequest, Plan, PlanStatus};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// Plan repository trait
#[async_trait]
pub trait PlanRepository: Send + Sync + 'static {
    async fn create(&self, ctx: &TenantContext, request: CreatePlanRequest) -> Result<Plan>;

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Plan>>;

    async fn list(&self, ctx: &TenantContext) -> Result<Vec<Plan>>;

    async fn set_status(&self, ctx: &TenantContext, id: Uuid, status: PlanStatus) -> Result<bool>;

    /// Whether any subscription references this plan; referenced plans have
    /// immutable pricing
    async fn has_subscriptions(&self, ctx: &TenantContext, id: Uuid) -> Result<bool>;
}

/// PostgreSQL implementation of the plan repository
#[derive(Clone)]
pub struct PostgresPlanRepository {
    pool: sqlx::PgPool,
}

impl PostgresPlanRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanRepository for PostgresPlanRepository {
    async fn create(&self, ctx: &TenantContext, request: CreatePlanRequest) -> Result<Plan> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (
                tenant_id, name, base_price_cents, currency,
                billing_interval, billing_interval_count, trial_period_days, plan_type
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(&request.name)
        .bind(request.base_price_cents)
        .bind(request.currency)
        .bind(request.billing_interval)
        .bind(request.billing_interval_count)
        .bind(request.trial_period_days)
        .bind(request.plan_type)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(plan)
    }

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(plan)
    }

    async fn list(&self, ctx: &TenantContext) -> Result<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(plans)
    }

    async fn set_status(&self, ctx: &TenantContext, id: Uuid, status: PlanStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE plans SET status = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn has_subscriptions(&self, ctx: &TenantContext, id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subscriptions WHERE tenant_id = $1 AND plan_id = $2
            )
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists)
    }
}
