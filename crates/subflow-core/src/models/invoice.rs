//! Invoice, invoice line and payment attempt models
//!
//! An invoice is the immutable snapshot of one billing cycle. The unique key
//! `(tenant_id, subscription_id, period_start, period_end)` is the
//! idempotency anchor of the whole billing flow: however many renewal tasks
//! race, only one invoice per cycle can exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Currency;

/// Invoice status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Awaiting payment
    Open,
    /// Some payment attempt succeeded
    Paid,
    /// Voided before payment
    Void,
    /// Written off after exhausted collection
    Uncollectible,
}

/// Invoice entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub invoice_number: String,

    // Billing period covered
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    // Amounts, finalized from the lines at creation
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub currency: Currency,

    pub status: InvoiceStatus,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Invoice line item
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLine {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub total_cents: i64,
    pub currency: Currency,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// New invoice line, before insertion
#[derive(Debug, Clone)]
pub struct NewInvoiceLine {
    pub description: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub currency: Currency,
}

impl NewInvoiceLine {
    pub fn total_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity as i64
    }
}

/// Payment attempt status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_attempt_status", rename_all = "snake_case")]
pub enum PaymentAttemptStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// One attempt to collect an invoice.
///
/// Every retry inserts a new row; the invoice flips to paid only when some
/// attempt reaches succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub status: PaymentAttemptStatus,
    pub payment_method_ref: String,
    pub external_payment_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub attempt_number: i32,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Generate the stable idempotency key handed to the payment provider for
/// one attempt on one invoice
pub fn payment_idempotency_key(invoice_id: Uuid, attempt_number: i32) -> String {
    format!("{}:{}", invoice_id, attempt_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_total() {
        let line = NewInvoiceLine {
            description: "Monthly box".to_string(),
            quantity: 2,
            unit_price_cents: 1499,
            currency: Currency::USD,
        };
        assert_eq!(line.total_cents(), 2998);
    }

    #[test]
    fn test_payment_idempotency_key_is_stable() {
        let invoice_id = Uuid::new_v4();
        let a = payment_idempotency_key(invoice_id, 2);
        let b = payment_idempotency_key(invoice_id, 2);
        assert_eq!(a, b);
        assert_ne!(a, payment_idempotency_key(invoice_id, 3));
    }
}
