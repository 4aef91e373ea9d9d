//! Subscription model: the long-lived contract between a customer and
//! one or more plans
//!
//! A subscription always holds at least one item. Ecommerce contracts carry
//! several independently renewable items; "simple" is the single-item
//! degenerate case. Nothing downstream branches on a contract-type flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::{BillingInterval, Currency, PlanType};

/// Subscription status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Trial period before billing starts
    Trialing,
    /// Active and billing
    Active,
    /// Paused temporarily; renewals stop until resumed
    Paused,
    /// Cancelled (terminal)
    Canceled,
    /// Period ended without renewal (terminal)
    Expired,
}

impl SubscriptionStatus {
    /// Whether the state machine permits `self -> to`.
    ///
    /// trialing -> active | paused | canceled
    /// active   -> paused | canceled | expired
    /// paused   -> active | canceled
    /// canceled, expired are terminal
    pub fn can_transition_to(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, to),
            (Trialing, Active)
                | (Trialing, Paused)
                | (Trialing, Canceled)
                | (Active, Paused)
                | (Active, Canceled)
                | (Active, Expired)
                | (Paused, Active)
                | (Paused, Canceled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled | SubscriptionStatus::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// Cancellation reason
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "cancellation_reason", rename_all = "snake_case")]
pub enum CancellationReason {
    CustomerRequested,
    PaymentFailed,
    Fraudulent,
    TooExpensive,
    NotUseful,
    Other,
}

/// Pricing and interval frozen at subscription creation time.
///
/// Stored as JSONB on the subscription row; never rewritten after the first
/// insert, so later plan edits cannot change what an existing contract pays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSnapshot {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub base_price_cents: i64,
    pub currency: Currency,
    pub billing_interval: BillingInterval,
    pub billing_interval_count: i32,
    pub trial_period_days: i32,
    pub plan_type: PlanType,
}

/// Shipping address captured on the subscription and snapshotted onto each
/// delivery instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    pub state: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 2))]
    pub country: String,
    pub recipient: Option<String>,
}

/// Subscription entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,

    pub status: SubscriptionStatus,

    // Current billing period; start < end always holds
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_renewal_at: DateTime<Utc>,

    // Trial
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,

    // Payment
    pub payment_method_ref: String,

    // Fulfillment
    pub shipping_address: Option<sqlx::types::Json<ShippingAddress>>,

    /// Frozen pricing/interval at creation time; immutable once written
    pub plan_snapshot: sqlx::types::Json<PlanSnapshot>,

    // Cancellation
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<CancellationReason>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn snapshot(&self) -> &PlanSnapshot {
        &self.plan_snapshot.0
    }

    /// Period start for the next invoice: the current period end, except on
    /// the first paid cycle after a trial, where billing starts at trial end.
    pub fn next_period_start(&self) -> DateTime<Utc> {
        match self.trial_end {
            Some(trial_end) if trial_end >= self.current_period_end => trial_end,
            _ => self.current_period_end,
        }
    }
}

/// Subscription item: one unit within a subscription, renewing on the
/// contract's schedule with its own price and quantity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub currency: Currency,
    pub item_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionItem {
    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity as i64
    }
}

/// Append-only audit row for a subscription
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionHistory {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub action: String,
    pub performed_by: String,
    pub performed_by_type: String,
    pub metadata: serde_json::Value,
    pub performed_at: DateTime<Utc>,
}

/// History actions written by the lifecycle service
pub mod history_action {
    pub const CREATED: &str = "created";
    pub const PAUSED: &str = "paused";
    pub const RESUMED: &str = "resumed";
    pub const CANCELED: &str = "canceled";
    pub const MODIFIED: &str = "modified";
    pub const TRIAL_ENDED: &str = "trial_ended";
    pub const EXPIRED: &str = "expired";
    pub const RENEWED: &str = "renewed";
}

/// One product line in a create request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubscriptionProductRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    /// Price override in cents; defaults to the plan's base price
    pub unit_price_cents: Option<i64>,
    pub item_config: Option<serde_json::Value>,
}

/// Create subscription request
///
/// `products` may be empty for a simple subscription, in which case a single
/// item is created from the plan itself.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub payment_method_ref: String,
    #[validate]
    pub products: Vec<SubscriptionProductRequest>,
    pub shipping_address: Option<ShippingAddress>,
    /// Override the plan's trial length; None uses the plan default
    pub trial_period_days: Option<i32>,
    pub start_at: Option<DateTime<Utc>>,
}

/// Cancel subscription request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelSubscriptionRequest {
    pub reason: CancellationReason,
    #[validate(length(max = 500))]
    pub reason_details: Option<String>,
    /// Defer the transition to the end of the current period
    pub cancel_at_period_end: bool,
}

/// Modify subscription request: plan change, address change, item changes.
///
/// Changes never touch past snapshots; a plan change takes effect at the
/// next renewal.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct ModifySubscriptionRequest {
    pub plan_id: Option<Uuid>,
    pub payment_method_ref: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
    #[validate]
    pub items: Option<Vec<SubscriptionProductRequest>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_allows_documented_transitions() {
        use SubscriptionStatus::*;
        assert!(Trialing.can_transition_to(Active));
        assert!(Trialing.can_transition_to(Canceled));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Expired));
        assert!(Paused.can_transition_to(Canceled));
    }

    #[test]
    fn test_state_machine_rejects_terminal_exits() {
        use SubscriptionStatus::*;
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(Paused));
        assert!(Canceled.is_terminal());
        assert!(Expired.is_terminal());
    }

    #[test]
    fn test_state_machine_rejects_illegal_moves() {
        use SubscriptionStatus::*;
        assert!(!Paused.can_transition_to(Expired));
        assert!(!Trialing.can_transition_to(Expired));
        assert!(!Active.can_transition_to(Trialing));
    }

    #[test]
    fn test_item_line_total() {
        let now = Utc::now();
        let item = SubscriptionItem {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            quantity: 3,
            unit_price_cents: 2999,
            currency: Currency::USD,
            item_config: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(item.line_total_cents(), 8997);
    }
}
