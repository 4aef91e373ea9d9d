//! Entitlement repository
//!
//! Grants upsert on `(tenant_id, customer_id, entitlement_key)`: a renewal
//! extends the existing row's validity window instead of inserting a second
//! grant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Entitlement, NewOutboxEvent};
use crate::outbox;
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// One grant to upsert
#[derive(Debug, Clone)]
pub struct NewEntitlement {
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub entitlement_type: String,
    pub entitlement_key: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub external_ref: Option<String>,
}

/// Entitlement repository trait
#[async_trait]
pub trait EntitlementRepository: Send + Sync + 'static {
    /// Upsert the grants for one invoice and emit `entitlement.granted` per
    /// grant, atomically. Re-running converges on the same rows.
    async fn grant(
        &self,
        ctx: &TenantContext,
        grants: Vec<NewEntitlement>,
    ) -> Result<Vec<Entitlement>>;

    /// Revoke every active entitlement of a subscription, emitting
    /// `entitlement.revoked` per row. Returns the revoked rows.
    async fn revoke_for_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>>;

    /// Find one entitlement by its key
    async fn find_by_key(
        &self,
        ctx: &TenantContext,
        customer_id: Uuid,
        entitlement_key: &str,
    ) -> Result<Option<Entitlement>>;

    /// List a subscription's entitlements
    async fn list_by_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>>;

    /// Flip active rows whose validity window has lapsed to expired, across
    /// tenants. Run by the sweeper. Returns the number of rows expired.
    async fn expire_lapsed_all_tenants(&self, limit: i64) -> Result<u64>;
}

/// PostgreSQL implementation of the entitlement repository
#[derive(Clone)]
pub struct PostgresEntitlementRepository {
    pool: sqlx::PgPool,
}

impl PostgresEntitlementRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementRepository for PostgresEntitlementRepository {
    async fn grant(
        &self,
        ctx: &TenantContext,
        grants: Vec<NewEntitlement>,
    ) -> Result<Vec<Entitlement>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut granted = Vec::with_capacity(grants.len());

        for grant in &grants {
            let row = sqlx::query_as::<_, Entitlement>(
                r#"
                INSERT INTO entitlements (
                    tenant_id, customer_id, subscription_id, entitlement_type,
                    entitlement_key, status, valid_from, valid_until, payload, external_ref
                ) VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9)
                ON CONFLICT (tenant_id, customer_id, entitlement_key) DO UPDATE SET
                    status = 'active',
                    valid_until = GREATEST(entitlements.valid_until, EXCLUDED.valid_until),
                    payload = EXCLUDED.payload,
                    external_ref = COALESCE(EXCLUDED.external_ref, entitlements.external_ref),
                    updated_at = NOW()
                RETURNING *
                "#,
            )
            .bind(ctx.tenant_id)
            .bind(grant.customer_id)
            .bind(grant.subscription_id)
            .bind(&grant.entitlement_type)
            .bind(&grant.entitlement_key)
            .bind(grant.valid_from)
            .bind(grant.valid_until)
            .bind(&grant.payload)
            .bind(&grant.external_ref)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;

            outbox::emit(
                &mut tx,
                ctx.tenant_id,
                &NewOutboxEvent::new(
                    crate::models::event_type::ENTITLEMENT_GRANTED,
                    crate::outbox::payload::entitlement(&row),
                )
                .with_key(format!("granted_{}_{}", row.entitlement_key, row.valid_until.timestamp())),
            )
            .await?;

            granted.push(row);
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(granted)
    }

    async fn revoke_for_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let revoked = sqlx::query_as::<_, Entitlement>(
            r#"
            UPDATE entitlements
            SET status = 'revoked', updated_at = NOW()
            WHERE tenant_id = $1 AND subscription_id = $2 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for row in &revoked {
            outbox::emit(
                &mut tx,
                ctx.tenant_id,
                &NewOutboxEvent::new(
                    crate::models::event_type::ENTITLEMENT_REVOKED,
                    crate::outbox::payload::entitlement(row),
                ),
            )
            .await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(revoked)
    }

    async fn find_by_key(
        &self,
        ctx: &TenantContext,
        customer_id: Uuid,
        entitlement_key: &str,
    ) -> Result<Option<Entitlement>> {
        let entitlement = sqlx::query_as::<_, Entitlement>(
            r#"
            SELECT * FROM entitlements
            WHERE tenant_id = $1 AND customer_id = $2 AND entitlement_key = $3
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(customer_id)
        .bind(entitlement_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(entitlement)
    }

    async fn list_by_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Vec<Entitlement>> {
        let entitlements = sqlx::query_as::<_, Entitlement>(
            r#"
            SELECT * FROM entitlements
            WHERE tenant_id = $1 AND subscription_id = $2
            ORDER BY created_at
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(entitlements)
    }

    async fn expire_lapsed_all_tenants(&self, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET status = 'expired', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM entitlements
                WHERE status = 'active' AND valid_until < NOW()
                LIMIT $1
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}
