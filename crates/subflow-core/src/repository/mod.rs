//! Repository module for database access
//!
//! One repository per aggregate, each a trait plus a PostgreSQL
//! implementation built on parameterized statements. Every tenant-scoped
//! method takes a `TenantContext`; the only cross-tenant reads are the
//! sweeper scans and the worker claim/reap/relay paths, all named
//! accordingly.

pub mod customer_repository;
pub mod delivery_repository;
pub mod entitlement_repository;
pub mod invoice_repository;
pub mod job_repository;
pub mod outbox_repository;
pub mod plan_repository;
pub mod subscription_repository;
pub mod task_repository;
pub mod tenant_repository;
pub mod webhook_repository;

pub use customer_repository::{CustomerRepository, PostgresCustomerRepository};
pub use delivery_repository::{DeliveryRepository, NewDelivery, PostgresDeliveryRepository};
pub use entitlement_repository::{
    EntitlementRepository, NewEntitlement, PostgresEntitlementRepository,
};
pub use invoice_repository::{
    InvoiceRepository, NewInvoiceCycle, NewPaymentAttempt, PostgresInvoiceRepository,
};
pub use job_repository::{JobConfigRow, JobRepository, PostgresJobRepository, SweeperRunRecord};
pub use outbox_repository::{NewWebhookDelivery, OutboxRepository, PostgresOutboxRepository};
pub use plan_repository::{PlanRepository, PostgresPlanRepository};
pub use subscription_repository::{
    NewHistoryEntry, NewSubscription, NewSubscriptionItem, PostgresSubscriptionRepository,
    StatusChange, SubscriptionRepository, SubscriptionUpdate,
};
pub use task_repository::{PostgresTaskRepository, TaskRepository};
pub use tenant_repository::{PostgresTenantRepository, TenantRepository};
pub use webhook_repository::{
    DeliveryDispatch, NewWebhookEndpoint, PostgresWebhookRepository, WebhookRepository,
};

use crate::config::DatabaseConfig;

/// Connect a PostgreSQL pool from configuration
pub async fn create_pool(config: &DatabaseConfig) -> crate::Result<sqlx::PgPool> {
    use sqlx::postgres::PgPoolOptions;

    tracing::info!(
        "Connecting to PostgreSQL at {}:{}/{}...",
        config.host,
        config.port,
        config.database
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url())
        .await
        .map_err(crate::Error::Database)?;

    tracing::info!("PostgreSQL connected successfully");
    Ok(pool)
}
