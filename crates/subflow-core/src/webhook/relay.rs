//! Outbox fan-out and webhook dispatch loops

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::repository::{
    DeliveryDispatch, NewWebhookDelivery, OutboxRepository, WebhookRepository,
};
use crate::webhook::signature;
use crate::{Error, Result};

/// Response bodies stored for debugging are capped at this many bytes
const RESPONSE_BODY_CAP: usize = 1024;

/// Wire body; field order here is the wire order, and the signed bytes are
/// exactly these serialized bytes
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    event_id: Uuid,
    event_type: &'a str,
    timestamp: String,
    data: &'a serde_json::Value,
}

/// Build the exact request bytes for an event
fn event_body(
    event_id: Uuid,
    event_type: &str,
    created_at: DateTime<Utc>,
    data: &serde_json::Value,
) -> Result<Vec<u8>> {
    let body = WebhookBody {
        event_id,
        event_type,
        timestamp: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        data,
    };
    Ok(serde_json::to_vec(&body)?)
}

/// Webhook relay
pub struct WebhookRelay {
    outbox: Arc<dyn OutboxRepository>,
    webhooks: Arc<dyn WebhookRepository>,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookRelay {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        webhooks: Arc<dyn WebhookRepository>,
        config: WebhookConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| Error::config(format!("Could not build HTTP client: {}", e)))?;

        Ok(Self {
            outbox,
            webhooks,
            config,
            client,
        })
    }

    /// Run fan-out and dispatch until the process exits
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Webhook relay running");
            loop {
                match self.fanout_pass().await {
                    Ok(published) if published > 0 => {
                        debug!(published, "Fan-out pass published events");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Fan-out pass failed"),
                }

                match self.dispatch_pass().await {
                    Ok(dispatched) if dispatched > 0 => {
                        debug!(dispatched, "Dispatch pass sent deliveries");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Dispatch pass failed"),
                }

                sleep(Duration::from_secs(self.config.poll_interval_seconds)).await;
            }
        })
    }

    /// Publish unpublished outbox events into per-endpoint delivery rows.
    /// Events with no subscribed endpoint are still marked published.
    pub async fn fanout_pass(&self) -> Result<usize> {
        let events = self
            .outbox
            .fetch_unpublished(self.config.fanout_batch_size)
            .await?;
        let count = events.len();

        for event in events {
            let endpoints = self
                .webhooks
                .active_endpoints_for_event(event.tenant_id, &event.event_type)
                .await?;

            let deliveries: Vec<NewWebhookDelivery> = endpoints
                .iter()
                .map(|endpoint| NewWebhookDelivery {
                    endpoint_id: endpoint.id,
                    max_attempts: self.config.max_attempts,
                })
                .collect();

            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                endpoints = deliveries.len(),
                "Publishing event"
            );

            self.outbox.publish(&event, deliveries).await?;
        }

        Ok(count)
    }

    /// POST due deliveries and record outcomes
    pub async fn dispatch_pass(&self) -> Result<usize> {
        let due = self
            .webhooks
            .due_deliveries(self.config.dispatch_batch_size)
            .await?;
        let count = due.len();

        for dispatch in due {
            self.dispatch_one(&dispatch).await;
        }

        Ok(count)
    }

    async fn dispatch_one(&self, dispatch: &DeliveryDispatch) {
        let body = match event_body(
            dispatch.event_id,
            &dispatch.event_type,
            dispatch.event_created_at,
            &dispatch.event_payload,
        ) {
            Ok(body) => body,
            Err(e) => {
                // Cannot serialize; retrying will not help, burn the budget
                warn!(delivery_id = %dispatch.delivery_id, error = %e, "Body build failed");
                let _ = self
                    .webhooks
                    .record_failure(
                        dispatch.delivery_id,
                        None,
                        None,
                        Some(format!("body serialization: {}", e)),
                        self.config.retry_backoff_base_seconds,
                    )
                    .await;
                return;
            }
        };

        let sig = signature::sign(&body, &dispatch.secret);

        let response = self
            .client
            .post(&dispatch.url)
            .header("Content-Type", "application/json")
            .header("X-Event-Type", &dispatch.event_type)
            .header("X-Event-Id", dispatch.event_id.to_string())
            .header("X-Webhook-Signature", sig)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(
                        delivery_id = %dispatch.delivery_id,
                        status = status.as_u16(),
                        "Webhook delivered"
                    );
                    if let Err(e) = self
                        .webhooks
                        .record_success(dispatch.delivery_id, status.as_u16() as i32)
                        .await
                    {
                        error!(delivery_id = %dispatch.delivery_id, error = %e, "Could not record success");
                    }
                } else {
                    let body_text = response.text().await.unwrap_or_default();
                    let truncated: String = body_text.chars().take(RESPONSE_BODY_CAP).collect();
                    warn!(
                        delivery_id = %dispatch.delivery_id,
                        status = status.as_u16(),
                        attempt = dispatch.attempt_count + 1,
                        max_attempts = dispatch.max_attempts,
                        "Webhook endpoint returned error"
                    );
                    if let Err(e) = self
                        .webhooks
                        .record_failure(
                            dispatch.delivery_id,
                            Some(status.as_u16() as i32),
                            Some(truncated),
                            None,
                            self.config.retry_backoff_base_seconds,
                        )
                        .await
                    {
                        error!(delivery_id = %dispatch.delivery_id, error = %e, "Could not record failure");
                    }
                }
            }
            // Timeouts and connection failures count as attempts
            Err(e) => {
                warn!(
                    delivery_id = %dispatch.delivery_id,
                    error = %e,
                    attempt = dispatch.attempt_count + 1,
                    "Webhook request failed"
                );
                if let Err(record_err) = self
                    .webhooks
                    .record_failure(
                        dispatch.delivery_id,
                        None,
                        None,
                        Some(e.to_string()),
                        self.config.retry_backoff_base_seconds,
                    )
                    .await
                {
                    error!(delivery_id = %dispatch.delivery_id, error = %record_err, "Could not record failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        OutboxEvent, WebhookDelivery, WebhookEndpoint, WebhookEndpointStatus,
    };
    use crate::repository::NewWebhookEndpoint;
    use crate::tenant::TenantContext;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    #[test]
    fn test_body_is_exact_camel_case_wire_format() {
        let event_id = Uuid::nil();
        let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        let data = serde_json::json!({"invoiceId": "abc"});

        let body = event_body(event_id, "invoice.paid", created_at, &data).unwrap();
        let text = String::from_utf8(body).unwrap();

        assert_eq!(
            text,
            r#"{"eventId":"00000000-0000-0000-0000-000000000000","eventType":"invoice.paid","timestamp":"2025-01-01T00:05:00Z","data":{"invoiceId":"abc"}}"#
        );
    }

    #[test]
    fn test_signature_matches_sent_bytes() {
        let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let data = serde_json::json!({"x": 1});
        let body = event_body(Uuid::nil(), "payment.failed", created_at, &data).unwrap();

        let sig = signature::sign(&body, "whsec_test");
        assert!(signature::verify(&body, "whsec_test", &sig));
    }

    // --- Relay plumbing mocks ---

    #[derive(Default)]
    struct StubOutboxRepository {
        events: Mutex<Vec<OutboxEvent>>,
        published: Mutex<Vec<(Uuid, usize)>>,
    }

    #[async_trait]
    impl OutboxRepository for StubOutboxRepository {
        async fn fetch_unpublished(&self, _limit: i64) -> crate::Result<Vec<OutboxEvent>> {
            Ok(self.events.lock().unwrap().drain(..).collect())
        }

        async fn publish(
            &self,
            event: &OutboxEvent,
            deliveries: Vec<NewWebhookDelivery>,
        ) -> crate::Result<()> {
            self.published.lock().unwrap().push((event.id, deliveries.len()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubWebhookRepository {
        endpoints: Vec<WebhookEndpoint>,
        due: Mutex<Vec<DeliveryDispatch>>,
        successes: Mutex<Vec<(Uuid, i32)>>,
        failures: Mutex<Vec<(Uuid, Option<i32>)>>,
    }

    #[async_trait]
    impl WebhookRepository for StubWebhookRepository {
        async fn register(
            &self,
            _ctx: &TenantContext,
            _endpoint: NewWebhookEndpoint,
        ) -> crate::Result<WebhookEndpoint> {
            unimplemented!()
        }

        async fn find_endpoint(
            &self,
            _ctx: &TenantContext,
            _id: Uuid,
        ) -> crate::Result<Option<WebhookEndpoint>> {
            Ok(None)
        }

        async fn list_endpoints(&self, _ctx: &TenantContext) -> crate::Result<Vec<WebhookEndpoint>> {
            Ok(self.endpoints.clone())
        }

        async fn update_endpoint(
            &self,
            _ctx: &TenantContext,
            _id: Uuid,
            _url: Option<String>,
            _subscribed_event_types: Option<Vec<String>>,
        ) -> crate::Result<Option<WebhookEndpoint>> {
            unimplemented!()
        }

        async fn disable_endpoint(&self, _ctx: &TenantContext, _id: Uuid) -> crate::Result<bool> {
            unimplemented!()
        }

        async fn active_endpoints_for_event(
            &self,
            tenant_id: Uuid,
            event_type: &str,
        ) -> crate::Result<Vec<WebhookEndpoint>> {
            Ok(self
                .endpoints
                .iter()
                .filter(|e| {
                    e.tenant_id == tenant_id
                        && e.status == WebhookEndpointStatus::Active
                        && e.is_subscribed_to(event_type)
                })
                .cloned()
                .collect())
        }

        async fn due_deliveries(&self, _limit: i64) -> crate::Result<Vec<DeliveryDispatch>> {
            Ok(self.due.lock().unwrap().drain(..).collect())
        }

        async fn record_success(&self, delivery_id: Uuid, response_status: i32) -> crate::Result<()> {
            self.successes.lock().unwrap().push((delivery_id, response_status));
            Ok(())
        }

        async fn record_failure(
            &self,
            delivery_id: Uuid,
            response_status: Option<i32>,
            _response_body: Option<String>,
            _error: Option<String>,
            _backoff_base_seconds: u64,
        ) -> crate::Result<()> {
            self.failures.lock().unwrap().push((delivery_id, response_status));
            Ok(())
        }

        async fn deliveries_for_event(
            &self,
            _ctx: &TenantContext,
            _outbox_event_id: Uuid,
        ) -> crate::Result<Vec<WebhookDelivery>> {
            Ok(Vec::new())
        }
    }

    fn endpoint(tenant_id: Uuid, types: &[&str]) -> WebhookEndpoint {
        let now = Utc::now();
        WebhookEndpoint {
            id: Uuid::new_v4(),
            tenant_id,
            url: "https://example.com/hooks".to_string(),
            secret: "whsec_test".to_string(),
            subscribed_event_types: types.iter().map(|s| s.to_string()).collect(),
            status: WebhookEndpointStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn outbox_event(tenant_id: Uuid, event_type: &str) -> OutboxEvent {
        OutboxEvent {
            id: Uuid::new_v4(),
            tenant_id,
            event_type: event_type.to_string(),
            event_key: None,
            event_payload: serde_json::json!({"k": "v"}),
            created_at: Utc::now(),
            published_at: None,
        }
    }

    #[tokio::test]
    async fn test_fanout_creates_one_delivery_per_subscribed_endpoint() {
        let tenant_id = Uuid::new_v4();
        let outbox = Arc::new(StubOutboxRepository::default());
        let event = outbox_event(tenant_id, "invoice.paid");
        outbox.events.lock().unwrap().push(event.clone());

        let webhooks = Arc::new(StubWebhookRepository {
            endpoints: vec![
                endpoint(tenant_id, &["invoice.paid"]),
                endpoint(tenant_id, &["*"]),
                endpoint(tenant_id, &["delivery.shipped"]),
                endpoint(Uuid::new_v4(), &["invoice.paid"]), // other tenant
            ],
            ..Default::default()
        });

        let relay =
            WebhookRelay::new(outbox.clone(), webhooks, WebhookConfig::default()).unwrap();
        let published = relay.fanout_pass().await.unwrap();

        assert_eq!(published, 1);
        let records = outbox.published.lock().unwrap();
        assert_eq!(records.as_slice(), &[(event.id, 2)]);
    }

    #[tokio::test]
    async fn test_fanout_publishes_even_without_matches() {
        let tenant_id = Uuid::new_v4();
        let outbox = Arc::new(StubOutboxRepository::default());
        let event = outbox_event(tenant_id, "entitlement.granted");
        outbox.events.lock().unwrap().push(event.clone());

        let webhooks = Arc::new(StubWebhookRepository::default());
        let relay =
            WebhookRelay::new(outbox.clone(), webhooks, WebhookConfig::default()).unwrap();
        relay.fanout_pass().await.unwrap();

        let records = outbox.published.lock().unwrap();
        assert_eq!(records.as_slice(), &[(event.id, 0)]);
    }

    fn dispatch_row(url: String, attempt_count: i32) -> DeliveryDispatch {
        DeliveryDispatch {
            delivery_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            endpoint_id: Uuid::new_v4(),
            attempt_count,
            max_attempts: 5,
            url,
            secret: "whsec_test".to_string(),
            event_id: Uuid::new_v4(),
            event_type: "invoice.paid".to_string(),
            event_payload: serde_json::json!({"invoiceId": "inv_1"}),
            event_created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_sends_signed_request_and_records_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header("Content-Type", "application/json"))
            .and(header("X-Event-Type", "invoice.paid"))
            .and(header_exists("X-Event-Id"))
            .and(header_exists("X-Webhook-Signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let row = dispatch_row(format!("{}/hooks", server.uri()), 0);
        let delivery_id = row.delivery_id;

        let webhooks = Arc::new(StubWebhookRepository::default());
        webhooks.due.lock().unwrap().push(row);

        let relay = WebhookRelay::new(
            Arc::new(StubOutboxRepository::default()),
            webhooks.clone(),
            WebhookConfig::default(),
        )
        .unwrap();

        let dispatched = relay.dispatch_pass().await.unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(
            webhooks.successes.lock().unwrap().as_slice(),
            &[(delivery_id, 200)]
        );
        assert!(webhooks.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_signature_verifies_against_received_bytes() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(|req: &Request| {
                let sig = req
                    .headers
                    .get("X-Webhook-Signature")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                // The signature must verify over the exact received bytes
                if signature::verify(&req.body, "whsec_test", &sig) {
                    ResponseTemplate::new(200)
                } else {
                    ResponseTemplate::new(401)
                }
            })
            .expect(1)
            .mount(&server)
            .await;

        let row = dispatch_row(server.uri(), 0);
        let delivery_id = row.delivery_id;

        let webhooks = Arc::new(StubWebhookRepository::default());
        webhooks.due.lock().unwrap().push(row);

        let relay = WebhookRelay::new(
            Arc::new(StubOutboxRepository::default()),
            webhooks.clone(),
            WebhookConfig::default(),
        )
        .unwrap();

        relay.dispatch_pass().await.unwrap();
        assert_eq!(
            webhooks.successes.lock().unwrap().as_slice(),
            &[(delivery_id, 200)]
        );
    }

    #[tokio::test]
    async fn test_dispatch_records_5xx_as_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let row = dispatch_row(server.uri(), 0);
        let delivery_id = row.delivery_id;

        let webhooks = Arc::new(StubWebhookRepository::default());
        webhooks.due.lock().unwrap().push(row);

        let relay = WebhookRelay::new(
            Arc::new(StubOutboxRepository::default()),
            webhooks.clone(),
            WebhookConfig::default(),
        )
        .unwrap();

        relay.dispatch_pass().await.unwrap();
        assert_eq!(
            webhooks.failures.lock().unwrap().as_slice(),
            &[(delivery_id, Some(500))]
        );
        assert!(webhooks.successes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_records_connection_failure() {
        // Nothing listens on this port
        let row = dispatch_row("http://127.0.0.1:1/hooks".to_string(), 0);
        let delivery_id = row.delivery_id;

        let webhooks = Arc::new(StubWebhookRepository::default());
        webhooks.due.lock().unwrap().push(row);

        let relay = WebhookRelay::new(
            Arc::new(StubOutboxRepository::default()),
            webhooks.clone(),
            WebhookConfig::default(),
        )
        .unwrap();

        relay.dispatch_pass().await.unwrap();
        let failures = webhooks.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0], (delivery_id, None));
    }
}
