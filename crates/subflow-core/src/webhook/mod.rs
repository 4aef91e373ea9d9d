//! Webhook relay
//!
//! Two loops drain the outbox toward consumer endpoints. Fan-out reads
//! unpublished events FIFO and creates one pending delivery per subscribed
//! active endpoint, marking the event published in the same transaction.
//! Dispatch POSTs due deliveries with a signed body and backs off
//! exponentially on anything that is not a 2xx. Ordering is best-effort per
//! endpoint; nothing is promised across endpoints or under retries.

pub mod relay;
pub mod signature;

pub use relay::WebhookRelay;
