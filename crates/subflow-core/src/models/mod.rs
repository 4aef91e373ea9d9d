use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub mod customer;
pub mod delivery;
pub mod entitlement;
pub mod invoice;
pub mod outbox;
pub mod plan;
pub mod subscription;
pub mod task;
pub mod tenant;
pub mod webhook;

// Re-export common models
pub use customer::*;
pub use delivery::*;
pub use entitlement::*;
pub use invoice::*;
pub use outbox::*;
pub use plan::*;
pub use subscription::*;
pub use task::*;
pub use tenant::*;
pub use webhook::*;

/// Common trait for all entities
pub trait Entity: Send + Sync {
    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
}

/// Pagination parameters
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Pagination {
    #[validate(range(min = 1))]
    pub page: i64,

    #[validate(range(min = 1, max = 500))]
    pub per_page: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}

/// Currency representation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "currency", rename_all = "UPPERCASE")]
pub enum Currency {
    USD,
    EUR,
    GBP,
    JPY,
    AUD,
    CAD,
    CNY,
    HKD,
    SGD,
}

impl Default for Currency {
    fn default() -> Self {
        Currency::USD
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::JPY => "JPY",
            Currency::AUD => "AUD",
            Currency::CAD => "CAD",
            Currency::CNY => "CNY",
            Currency::HKD => "HKD",
            Currency::SGD => "SGD",
        };
        write!(f, "{}", code)
    }
}

impl std::str::FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "JPY" => Ok(Currency::JPY),
            "AUD" => Ok(Currency::AUD),
            "CAD" => Ok(Currency::CAD),
            "CNY" => Ok(Currency::CNY),
            "HKD" => Ok(Currency::HKD),
            "SGD" => Ok(Currency::SGD),
            other => Err(format!("Unknown currency: {}", other)),
        }
    }
}

/// Billing interval for plans and plan snapshots
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "billing_interval", rename_all = "snake_case")]
pub enum BillingInterval {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingInterval {
    /// Advance a point in time by `count` intervals.
    ///
    /// Month-based intervals use calendar arithmetic (Jan 31 + 1 month =
    /// Feb 28/29); the day-count fallback only applies if the calendar
    /// addition overflows chrono's representable range.
    pub fn advance(&self, from: DateTime<Utc>, count: i32) -> DateTime<Utc> {
        let count = count.max(1) as i64;
        match self {
            BillingInterval::Daily => from + chrono::Duration::days(count),
            BillingInterval::Weekly => from + chrono::Duration::weeks(count),
            BillingInterval::Monthly => from
                .checked_add_months(chrono::Months::new(count as u32))
                .unwrap_or(from + chrono::Duration::days(30 * count)),
            BillingInterval::Quarterly => from
                .checked_add_months(chrono::Months::new(count as u32 * 3))
                .unwrap_or(from + chrono::Duration::days(90 * count)),
            BillingInterval::Yearly => from
                .checked_add_months(chrono::Months::new(count as u32 * 12))
                .unwrap_or(from + chrono::Duration::days(365 * count)),
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingInterval::Daily => "daily",
            BillingInterval::Weekly => "weekly",
            BillingInterval::Monthly => "monthly",
            BillingInterval::Quarterly => "quarterly",
            BillingInterval::Yearly => "yearly",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pagination_offset() {
        let p = Pagination {
            page: 3,
            per_page: 20,
        };
        assert_eq!(p.offset(), 40);
    }

    #[test]
    fn test_interval_advance_monthly() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = BillingInterval::Monthly.advance(start, 1);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_advance_monthly_clamps_short_months() {
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let end = BillingInterval::Monthly.advance(start, 1);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_advance_quarterly_count() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = BillingInterval::Quarterly.advance(start, 2);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_currency_round_trip() {
        let c: Currency = "usd".parse().unwrap();
        assert_eq!(c, Currency::USD);
        assert_eq!(c.to_string(), "USD");
        assert!("XXX".parse::<Currency>().is_err());
    }
}
