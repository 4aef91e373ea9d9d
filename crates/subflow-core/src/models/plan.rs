//! Plan model: priced billing template
//!
//! Pricing is immutable once a subscription references the plan; new
//! subscriptions freeze a snapshot at creation time instead of re-reading
//! the plan on every cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::{BillingInterval, Currency};

/// Plan status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "plan_status", rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Inactive,
}

impl Default for PlanStatus {
    fn default() -> Self {
        PlanStatus::Active
    }
}

/// What a plan entitles the customer to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "plan_type", rename_all = "snake_case")]
pub enum PlanType {
    /// Digital access only; renewals grant entitlements
    Digital,
    /// Physical goods only; renewals schedule deliveries
    Physical,
    /// Both deliveries and entitlements per cycle
    Hybrid,
}

impl PlanType {
    pub fn has_physical(&self) -> bool {
        matches!(self, PlanType::Physical | PlanType::Hybrid)
    }

    pub fn has_digital(&self) -> bool {
        matches!(self, PlanType::Digital | PlanType::Hybrid)
    }
}

/// Plan entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub base_price_cents: i64,
    pub currency: Currency,
    pub billing_interval: BillingInterval,
    pub billing_interval_count: i32,
    pub trial_period_days: i32,
    pub plan_type: PlanType,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create plan request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(range(min = 0))]
    pub base_price_cents: i64,
    pub currency: Currency,
    pub billing_interval: BillingInterval,
    #[validate(range(min = 1, max = 52))]
    pub billing_interval_count: i32,
    #[validate(range(min = 0, max = 365))]
    pub trial_period_days: i32,
    pub plan_type: PlanType,
}
