//! Invoice and payment attempt repository
//!
//! The two multi-write flows of the billing core live here so no partial
//! write can escape a transaction: cycle creation (invoice + lines + period
//! roll + charge task + outbox) and payment settlement (attempt + invoice +
//! fan-out tasks + outbox).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Currency, Invoice, InvoiceLine, NewInvoiceLine, NewOutboxEvent, NewTask, PaymentAttempt,
};
use crate::outbox;
use crate::repository::{subscription_repository, task_repository};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// Everything one renewal cycle commits together
#[derive(Debug, Clone)]
pub struct NewInvoiceCycle {
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub invoice_number: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: Currency,
    pub due_date: DateTime<Utc>,
    pub lines: Vec<NewInvoiceLine>,
    /// charge_payment task enqueued with the invoice
    pub charge_task_max_attempts: i32,
    pub renewed_event_payload: serde_json::Value,
}

impl NewInvoiceCycle {
    pub fn subtotal_cents(&self) -> i64 {
        self.lines.iter().map(|l| l.total_cents()).sum()
    }
}

/// New payment attempt row
#[derive(Debug, Clone)]
pub struct NewPaymentAttempt {
    pub invoice_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub payment_method_ref: String,
    pub attempt_number: i32,
}

/// Invoice repository trait
#[async_trait]
pub trait InvoiceRepository: Send + Sync + 'static {
    /// The idempotency lookup: at most one invoice per subscription period
    async fn find_by_period(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Invoice>>;

    /// Find an invoice by ID
    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Invoice>>;

    /// List an invoice's lines
    async fn lines(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<Vec<InvoiceLine>>;

    /// Create the invoice for one billing cycle: invoice + lines, the
    /// subscription's period roll, the charge task and the renewal event in
    /// one transaction.
    ///
    /// A concurrent duplicate is absorbed by the cycle unique constraint;
    /// the existing invoice is returned with `created = false`.
    async fn create_cycle(&self, ctx: &TenantContext, cycle: NewInvoiceCycle)
        -> Result<(Invoice, bool)>;

    /// Highest attempt number recorded for an invoice (0 when none)
    async fn latest_attempt_number(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<i32>;

    /// List payment attempts, oldest first
    async fn attempts(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<Vec<PaymentAttempt>>;

    /// Insert a pending payment attempt
    async fn insert_attempt(
        &self,
        ctx: &TenantContext,
        attempt: NewPaymentAttempt,
    ) -> Result<PaymentAttempt>;

    /// Settle a successful payment: attempt succeeded, invoice paid, the
    /// post-payment fan-out tasks enqueued and events emitted, atomically
    async fn mark_paid(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        attempt_id: Uuid,
        external_payment_id: Option<String>,
        fanout_tasks: Vec<NewTask>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Invoice>;

    /// Record a failed attempt with its provider error and events
    async fn mark_attempt_failed(
        &self,
        ctx: &TenantContext,
        attempt_id: Uuid,
        failure_code: Option<String>,
        failure_reason: Option<String>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<()>;
}

/// PostgreSQL implementation of the invoice repository
#[derive(Clone)]
pub struct PostgresInvoiceRepository {
    pool: sqlx::PgPool,
}

impl PostgresInvoiceRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceRepository for PostgresInvoiceRepository {
    async fn find_by_period(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE tenant_id = $1 AND subscription_id = $2
              AND period_start = $3 AND period_end = $4
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(invoice)
    }

    async fn find_by_id(&self, ctx: &TenantContext, id: Uuid) -> Result<Option<Invoice>> {
        let invoice =
            sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE tenant_id = $1 AND id = $2")
                .bind(ctx.tenant_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        Ok(invoice)
    }

    async fn lines(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<Vec<InvoiceLine>> {
        let lines = sqlx::query_as::<_, InvoiceLine>(
            r#"
            SELECT l.* FROM invoice_lines l
            JOIN invoices i ON i.id = l.invoice_id
            WHERE i.tenant_id = $1 AND l.invoice_id = $2
            ORDER BY l.created_at
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(lines)
    }

    async fn create_cycle(
        &self,
        ctx: &TenantContext,
        cycle: NewInvoiceCycle,
    ) -> Result<(Invoice, bool)> {
        let subtotal = cycle.subtotal_cents();
        let tax = 0i64;
        let total = subtotal + tax;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                tenant_id, subscription_id, customer_id, invoice_number,
                period_start, period_end, subtotal_cents, tax_cents, total_cents,
                currency, status, due_date
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'open', $11)
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(cycle.subscription_id)
        .bind(cycle.customer_id)
        .bind(&cycle.invoice_number)
        .bind(cycle.period_start)
        .bind(cycle.period_end)
        .bind(subtotal)
        .bind(tax)
        .bind(total)
        .bind(cycle.currency)
        .bind(cycle.due_date)
        .fetch_one(&mut *tx)
        .await;

        let invoice = match inserted {
            Ok(invoice) => invoice,
            Err(e) => {
                // A concurrent renewal for the same cycle won the insert;
                // converge on its invoice.
                let err = Error::Database(e);
                if err.is_unique_violation() {
                    tx.rollback().await.map_err(Error::Database)?;
                    let existing = self
                        .find_by_period(ctx, cycle.subscription_id, cycle.period_start, cycle.period_end)
                        .await?
                        .ok_or_else(|| Error::conflict("Invoice cycle raced and vanished"))?;
                    return Ok((existing, false));
                }
                return Err(err);
            }
        };

        for line in &cycle.lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines (
                    invoice_id, description, quantity, unit_price_cents,
                    total_cents, currency, period_start, period_end
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(invoice.id)
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price_cents)
            .bind(line.total_cents())
            .bind(line.currency)
            .bind(cycle.period_start)
            .bind(cycle.period_end)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        subscription_repository::advance_period_on(
            &mut tx,
            ctx.tenant_id,
            cycle.subscription_id,
            cycle.period_start,
            cycle.period_end,
        )
        .await?;

        let charge_task = NewTask::new(
            crate::models::TaskType::ChargePayment,
            crate::models::task_key::charge_payment(invoice.id),
            Utc::now(),
            cycle.charge_task_max_attempts,
            serde_json::to_value(crate::models::task_payload::ChargePayment {
                invoice_id: invoice.id,
            })?,
        );
        task_repository::enqueue_on(&mut tx, ctx.tenant_id, &charge_task).await?;

        outbox::emit(
            &mut tx,
            ctx.tenant_id,
            &NewOutboxEvent::new(
                crate::models::event_type::SUBSCRIPTION_RENEWED,
                cycle.renewed_event_payload.clone(),
            )
            .with_key(format!("renewed_{}", invoice.id)),
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;

        Ok((invoice, true))
    }

    async fn latest_attempt_number(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<i32> {
        let number: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(a.attempt_number) FROM payment_attempts a
            JOIN invoices i ON i.id = a.invoice_id
            WHERE i.tenant_id = $1 AND a.invoice_id = $2
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(invoice_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(number.unwrap_or(0))
    }

    async fn attempts(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<Vec<PaymentAttempt>> {
        let attempts = sqlx::query_as::<_, PaymentAttempt>(
            r#"
            SELECT a.* FROM payment_attempts a
            JOIN invoices i ON i.id = a.invoice_id
            WHERE i.tenant_id = $1 AND a.invoice_id = $2
            ORDER BY a.attempt_number
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(attempts)
    }

    async fn insert_attempt(
        &self,
        ctx: &TenantContext,
        attempt: NewPaymentAttempt,
    ) -> Result<PaymentAttempt> {
        let row = sqlx::query_as::<_, PaymentAttempt>(
            r#"
            INSERT INTO payment_attempts (
                invoice_id, amount_cents, currency, status,
                payment_method_ref, attempt_number
            )
            SELECT i.id, $3, $4, 'pending', $5, $6
            FROM invoices i
            WHERE i.tenant_id = $1 AND i.id = $2
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(attempt.invoice_id)
        .bind(attempt.amount_cents)
        .bind(attempt.currency)
        .bind(&attempt.payment_method_ref)
        .bind(attempt.attempt_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.ok_or_else(|| Error::not_found("Invoice not found"))
    }

    async fn mark_paid(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        attempt_id: Uuid,
        external_payment_id: Option<String>,
        fanout_tasks: Vec<NewTask>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Invoice> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = 'succeeded', external_payment_id = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(&external_payment_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'paid', paid_at = NOW(), updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(invoice) = invoice else {
            // Already settled by an earlier run of this idempotent handler.
            tx.rollback().await.map_err(Error::Database)?;
            return self
                .find_by_id(ctx, invoice_id)
                .await?
                .ok_or_else(|| Error::not_found("Invoice not found"));
        };

        for task in &fanout_tasks {
            task_repository::enqueue_on(&mut tx, ctx.tenant_id, task).await?;
        }

        for event in &events {
            outbox::emit(&mut tx, ctx.tenant_id, event).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(invoice)
    }

    async fn mark_attempt_failed(
        &self,
        ctx: &TenantContext,
        attempt_id: Uuid,
        failure_code: Option<String>,
        failure_reason: Option<String>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            r#"
            UPDATE payment_attempts a
            SET status = 'failed', failure_code = $2, failure_reason = $3, completed_at = NOW()
            FROM invoices i
            WHERE a.id = $1 AND i.id = a.invoice_id AND i.tenant_id = $4
            "#,
        )
        .bind(attempt_id)
        .bind(&failure_code)
        .bind(&failure_reason)
        .bind(ctx.tenant_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for event in &events {
            outbox::emit(&mut tx, ctx.tenant_id, event).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(())
    }
}
