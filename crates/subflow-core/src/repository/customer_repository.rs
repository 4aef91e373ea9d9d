//! Customer repository

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{CreateCustomerRequest, Customer};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// Customer repository trait
#[async_trait]
pub trait CustomerRepository: Send + Sync + 'static {
    async fn create(&self, ctx: &TenantContext, request: CreateCustomerRequest) -> Result<Customer>;

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Customer>>;

    async fn find_by_email(&self, ctx: &TenantContext, email: &str) -> Result<Option<Customer>>;

    async fn list(&self, ctx: &TenantContext, page: i64, per_page: i64) -> Result<Vec<Customer>>;
}

/// PostgreSQL implementation of the customer repository
#[derive(Clone)]
pub struct PostgresCustomerRepository {
    pool: sqlx::PgPool,
}

impl PostgresCustomerRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerRepository for PostgresCustomerRepository {
    async fn create(&self, ctx: &TenantContext, request: CreateCustomerRequest) -> Result<Customer> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (tenant_id, email, external_id, attributes)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(&request.email)
        .bind(&request.external_id)
        .bind(request.attributes.unwrap_or_else(|| serde_json::json!({})))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let err = Error::Database(e);
            if err.is_unique_violation() {
                Error::conflict("Customer email or external_id already exists for tenant")
            } else {
                err
            }
        })?;

        Ok(customer)
    }

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            "SELECT * FROM customers WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(customer)
    }

    async fn find_by_email(&self, ctx: &TenantContext, email: &str) -> Result<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            "SELECT * FROM customers WHERE tenant_id = $1 AND email = $2",
        )
        .bind(ctx.tenant_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(customer)
    }

    async fn list(&self, ctx: &TenantContext, page: i64, per_page: i64) -> Result<Vec<Customer>> {
        let offset = (page - 1).max(0) * per_page;
        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT * FROM customers WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(customers)
    }
}
