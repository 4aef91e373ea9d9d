//! Tenant repository

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{CreateTenantRequest, Tenant};
use crate::{Error, Result};

/// Tenant repository trait. Tenant rows are the identity boundary itself,
/// so these operations are administrative and not tenant-scoped.
#[async_trait]
pub trait TenantRepository: Send + Sync + 'static {
    async fn create(&self, request: CreateTenantRequest) -> Result<Tenant>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tenant>>;

    async fn list(&self) -> Result<Vec<Tenant>>;
}

/// PostgreSQL implementation of the tenant repository
#[derive(Clone)]
pub struct PostgresTenantRepository {
    pool: sqlx::PgPool,
}

impl PostgresTenantRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for PostgresTenantRepository {
    async fn create(&self, request: CreateTenantRequest) -> Result<Tenant> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "INSERT INTO tenants (name) VALUES ($1) RETURNING *",
        )
        .bind(&request.name)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(tenant)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(tenant)
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        let tenants = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(tenants)
    }
}
