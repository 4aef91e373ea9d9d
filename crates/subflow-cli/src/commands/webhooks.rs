//! `subflow webhook`: endpoint registration and inspection

use std::sync::Arc;
use validator::Validate;

use subflow_core::models::RegisterWebhookRequest;
use subflow_core::repository::{NewWebhookEndpoint, PostgresWebhookRepository, WebhookRepository};
use subflow_core::webhook::signature;
use subflow_core::{Config, Error, Result, TenantContext};

use crate::WebhookCommands;

pub async fn execute(config: Config, command: WebhookCommands) -> Result<()> {
    let pool = subflow_core::create_pool(&config.database).await?;
    let webhooks: Arc<dyn WebhookRepository> = Arc::new(PostgresWebhookRepository::new(pool));

    match command {
        WebhookCommands::Register {
            tenant,
            url,
            events,
        } => {
            let request = RegisterWebhookRequest {
                url,
                subscribed_event_types: events,
                secret: None,
            };
            request
                .validate()
                .map_err(|e| Error::validation(e.to_string()))?;

            let secret = request
                .secret
                .unwrap_or_else(signature::generate_secret);

            let ctx = TenantContext::system(tenant);
            let endpoint = webhooks
                .register(
                    &ctx,
                    NewWebhookEndpoint {
                        url: request.url,
                        secret: secret.clone(),
                        subscribed_event_types: request.subscribed_event_types,
                    },
                )
                .await?;

            println!("Endpoint {} registered", endpoint.id);
            // Shown once; only the hash of future payloads proves possession
            println!("Secret: {}", secret);
        }
        WebhookCommands::List { tenant } => {
            let ctx = TenantContext::system(tenant);
            let endpoints = webhooks.list_endpoints(&ctx).await?;
            if endpoints.is_empty() {
                println!("No endpoints registered");
            }
            for endpoint in endpoints {
                println!(
                    "{}  {:?}  {}  [{}]",
                    endpoint.id,
                    endpoint.status,
                    endpoint.url,
                    endpoint.subscribed_event_types.join(", ")
                );
            }
        }
        WebhookCommands::Disable { tenant, id } => {
            let ctx = TenantContext::system(tenant);
            if webhooks.disable_endpoint(&ctx, id).await? {
                println!("Endpoint {} disabled", id);
            } else {
                println!("No active endpoint {}", id);
            }
        }
    }

    Ok(())
}
