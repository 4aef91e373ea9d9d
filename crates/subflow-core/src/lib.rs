pub mod billing;
pub mod commerce;
pub mod config;
pub mod db;
pub mod error;
pub mod fulfillment;
pub mod lifecycle;
pub mod models;
pub mod outbox;
pub mod payment;
pub mod repository;
pub mod sweeper;
pub mod tasks;
pub mod tenant;
pub mod webhook;

// Re-export commonly used types
pub use config::Config;
pub use db::migrate::{auto_migrate, DbStatus, Migrator};
pub use error::{Error, Result};
pub use tenant::TenantContext;

pub use billing::{BillingService, ChargeOutcome};
pub use fulfillment::{FulfillmentService, OrderOutcome};
pub use lifecycle::LifecycleService;
pub use models::{BillingInterval, Currency, SubscriptionStatus, TaskStatus, TaskType};
pub use repository::create_pool;
pub use sweeper::RenewalSweeper;
pub use tasks::{Dispatcher, HandlerOutcome, HandlerRegistry, TaskHandler};
pub use webhook::WebhookRelay;

/// Current version of subflow
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_creation() {
        let err = Error::validation("Test validation error");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "validation");
    }
}
