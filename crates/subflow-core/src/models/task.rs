//! Scheduled task model: the persistent work list
//!
//! Tasks are the only way asynchronous business flows run. The unique
//! `(tenant_id, task_key)` constraint collapses duplicate enqueues, and the
//! claimed-with-lease protocol gives at-most-one in-flight execution per key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible for claiming once due
    Ready,
    /// Leased by a worker
    Claimed,
    Completed,
    /// Attempts exhausted; kept for operator attention
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Task type: routes a claimed task to its handler
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "task_type", rename_all = "snake_case")]
pub enum TaskType {
    SubscriptionRenewal,
    ProductRenewal,
    ChargePayment,
    CreateDelivery,
    CreateOrder,
    EntitlementGrant,
    TrialEnd,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::SubscriptionRenewal => "subscription_renewal",
            TaskType::ProductRenewal => "product_renewal",
            TaskType::ChargePayment => "charge_payment",
            TaskType::CreateDelivery => "create_delivery",
            TaskType::CreateOrder => "create_order",
            TaskType::EntitlementGrant => "entitlement_grant",
            TaskType::TrialEnd => "trial_end",
        };
        write!(f, "{}", s)
    }
}

/// Scheduled task entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub task_type: TaskType,
    pub task_key: String,
    pub status: TaskStatus,
    pub due_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub payload: serde_json::Value,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New task, before insertion
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub task_key: String,
    pub due_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(
        task_type: TaskType,
        task_key: impl Into<String>,
        due_at: DateTime<Utc>,
        max_attempts: i32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_type,
            task_key: task_key.into(),
            due_at,
            max_attempts,
            payload,
        }
    }
}

/// Deterministic task keys: the same domain keys always produce the same
/// task key, so racing enqueues collapse on the unique constraint
pub mod task_key {
    use uuid::Uuid;

    pub fn charge_payment(invoice_id: Uuid) -> String {
        format!("payment_{}", invoice_id)
    }

    pub fn create_delivery(invoice_id: Uuid) -> String {
        format!("delivery_{}", invoice_id)
    }

    pub fn create_order(delivery_id: Uuid) -> String {
        format!("order_{}", delivery_id)
    }

    pub fn entitlement_grant(invoice_id: Uuid) -> String {
        format!("entitlement_{}", invoice_id)
    }

    pub fn product_renewal(subscription_id: Uuid, product_id: Uuid) -> String {
        format!("product_renewal_{}_{}", subscription_id, product_id)
    }

    pub fn subscription_renewal(subscription_id: Uuid) -> String {
        format!("subscription_renewal_{}", subscription_id)
    }

    pub fn trial_end(subscription_id: Uuid) -> String {
        format!("trial_end_{}", subscription_id)
    }
}

/// Typed task payloads, serialized into the `payload` column
pub mod task_payload {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProductRenewal {
        pub subscription_id: Uuid,
        pub item_id: Uuid,
        pub product_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SubscriptionRenewal {
        pub subscription_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChargePayment {
        pub invoice_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CreateDelivery {
        pub invoice_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CreateOrder {
        pub delivery_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EntitlementGrant {
        pub invoice_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrialEnd {
        pub subscription_id: Uuid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_keys_deterministic() {
        let invoice_id = Uuid::new_v4();
        assert_eq!(
            task_key::charge_payment(invoice_id),
            task_key::charge_payment(invoice_id)
        );
        assert_eq!(
            task_key::charge_payment(invoice_id),
            format!("payment_{}", invoice_id)
        );
    }

    #[test]
    fn test_task_keys_distinct_per_type() {
        let id = Uuid::new_v4();
        assert_ne!(task_key::charge_payment(id), task_key::create_delivery(id));
        assert_ne!(task_key::create_delivery(id), task_key::entitlement_grant(id));
    }

    #[test]
    fn test_product_renewal_key_shape() {
        let sub = Uuid::new_v4();
        let product = Uuid::new_v4();
        assert_eq!(
            task_key::product_renewal(sub, product),
            format!("product_renewal_{}_{}", sub, product)
        );
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = task_payload::ChargePayment {
            invoice_id: Uuid::new_v4(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: task_payload::ChargePayment = serde_json::from_value(value).unwrap();
        assert_eq!(back.invoice_id, payload.invoice_id);
    }
}
