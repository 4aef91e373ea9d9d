//! Transactional outbox
//!
//! Domain events are inserted on the same connection (and therefore the same
//! transaction) as the state change that produced them, so an event is
//! visible exactly when its cause is. The webhook relay drains unpublished
//! rows; nothing else reads this table.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::NewOutboxEvent;
use crate::{Error, Result};

/// Insert an outbox event on an open transaction.
///
/// The caller owns the transaction; the event commits or rolls back with the
/// producing state change.
pub async fn emit(conn: &mut PgConnection, tenant_id: Uuid, event: &NewOutboxEvent) -> Result<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO outbox_events (tenant_id, event_type, event_key, event_payload)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(tenant_id)
    .bind(&event.event_type)
    .bind(&event.event_key)
    .bind(&event.event_payload)
    .fetch_one(conn)
    .await
    .map_err(Error::Database)?;

    Ok(id)
}

/// Payload builders for the events the core emits. Payload shape is part of
/// the webhook contract; field names are camelCase on the wire.
pub mod payload {
    use serde_json::json;
    use uuid::Uuid;

    use crate::models::{
        DeliveryInstance, Entitlement, Invoice, PaymentAttempt, Subscription,
    };

    pub fn subscription(sub: &Subscription) -> serde_json::Value {
        json!({
            "subscriptionId": sub.id,
            "customerId": sub.customer_id,
            "planId": sub.plan_id,
            "status": sub.status,
            "currentPeriodStart": sub.current_period_start,
            "currentPeriodEnd": sub.current_period_end,
            "nextRenewalAt": sub.next_renewal_at,
        })
    }

    pub fn invoice(invoice: &Invoice) -> serde_json::Value {
        json!({
            "invoiceId": invoice.id,
            "invoiceNumber": invoice.invoice_number,
            "subscriptionId": invoice.subscription_id,
            "customerId": invoice.customer_id,
            "periodStart": invoice.period_start,
            "periodEnd": invoice.period_end,
            "totalCents": invoice.total_cents,
            "currency": invoice.currency,
            "status": invoice.status,
        })
    }

    pub fn payment(invoice: &Invoice, attempt: &PaymentAttempt) -> serde_json::Value {
        json!({
            "invoiceId": invoice.id,
            "subscriptionId": invoice.subscription_id,
            "attemptNumber": attempt.attempt_number,
            "amountCents": attempt.amount_cents,
            "currency": attempt.currency,
            "status": attempt.status,
            "externalPaymentId": attempt.external_payment_id,
            "failureCode": attempt.failure_code,
            "failureReason": attempt.failure_reason,
        })
    }

    pub fn delivery(delivery: &DeliveryInstance) -> serde_json::Value {
        json!({
            "deliveryId": delivery.id,
            "subscriptionId": delivery.subscription_id,
            "invoiceId": delivery.invoice_id,
            "cycleKey": delivery.cycle_key,
            "status": delivery.status,
            "externalOrderRef": delivery.external_order_ref,
        })
    }

    pub fn entitlement(ent: &Entitlement) -> serde_json::Value {
        json!({
            "entitlementId": ent.id,
            "customerId": ent.customer_id,
            "subscriptionId": ent.subscription_id,
            "entitlementType": ent.entitlement_type,
            "entitlementKey": ent.entitlement_key,
            "status": ent.status,
            "validFrom": ent.valid_from,
            "validUntil": ent.valid_until,
        })
    }

    pub fn payment_exhausted(invoice_id: Uuid, subscription_id: Uuid, attempts: i32) -> serde_json::Value {
        json!({
            "invoiceId": invoice_id,
            "subscriptionId": subscription_id,
            "attempts": attempts,
        })
    }
}
