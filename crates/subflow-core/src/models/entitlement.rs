//! Entitlement model: per-cycle digital grants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Entitlement status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "entitlement_status", rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Revoked,
    Expired,
}

/// Entitlement entity
///
/// Unique `(tenant_id, customer_id, entitlement_key)`; grants upsert, so a
/// renewal extends `valid_until` on the existing row instead of inserting a
/// second one.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Entitlement {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub entitlement_type: String,
    pub entitlement_key: String,
    pub status: EntitlementStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic entitlement key for a product grant under a subscription
pub fn entitlement_key(
    entitlement_type: &str,
    subscription_id: Uuid,
    product_id: Uuid,
) -> String {
    format!("{}:{}:{}", entitlement_type, subscription_id, product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entitlement_key_deterministic() {
        let sub = Uuid::new_v4();
        let product = Uuid::new_v4();
        assert_eq!(
            entitlement_key("access", sub, product),
            entitlement_key("access", sub, product)
        );
        assert_ne!(
            entitlement_key("access", sub, product),
            entitlement_key("license", sub, product)
        );
    }
}
