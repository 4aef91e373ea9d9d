pub mod db;
pub mod run;
pub mod tasks;
pub mod webhooks;

use std::sync::Arc;

use subflow_core::billing::{
    BillingService, ChargePaymentHandler, ProductRenewalHandler, SubscriptionRenewalHandler,
};
use subflow_core::commerce::providers::SandboxCommerceProvider;
use subflow_core::commerce::CommerceProviderRegistry;
use subflow_core::fulfillment::{
    CreateDeliveryHandler, CreateOrderHandler, EntitlementGrantHandler, FulfillmentService,
};
use subflow_core::lifecycle::{LifecycleService, TrialEndHandler};
use subflow_core::models::TaskType;
use subflow_core::payment::providers::SandboxPaymentProvider;
use subflow_core::payment::PaymentProviderRegistry;
use subflow_core::repository::{
    PostgresCustomerRepository, PostgresDeliveryRepository, PostgresEntitlementRepository,
    PostgresInvoiceRepository, PostgresJobRepository, PostgresOutboxRepository,
    PostgresPlanRepository, PostgresSubscriptionRepository, PostgresTaskRepository,
    PostgresWebhookRepository,
};
use subflow_core::{
    Config, HandlerRegistry, RenewalSweeper, Result, WebhookRelay,
};

/// Everything the engine runs on, wired once at startup
pub struct Engine {
    pub pool: sqlx::PgPool,
    pub task_repo: Arc<PostgresTaskRepository>,
    pub registry: Arc<HandlerRegistry>,
    pub sweeper: Arc<RenewalSweeper>,
    pub relay: Arc<WebhookRelay>,
    pub config: Config,
}

/// Wire repositories, providers, services and the handler table.
///
/// Handler registration happens here, not inside the dispatcher: the
/// dispatcher only ever sees the table, so billing and fulfillment stay
/// free of any scheduler dependency.
pub async fn build_engine(config: Config) -> Result<Engine> {
    let pool = subflow_core::create_pool(&config.database).await?;

    let subscriptions = Arc::new(PostgresSubscriptionRepository::new(pool.clone()));
    let invoices = Arc::new(PostgresInvoiceRepository::new(pool.clone()));
    let deliveries = Arc::new(PostgresDeliveryRepository::new(pool.clone()));
    let entitlements = Arc::new(PostgresEntitlementRepository::new(pool.clone()));
    let plans = Arc::new(PostgresPlanRepository::new(pool.clone()));
    let customers = Arc::new(PostgresCustomerRepository::new(pool.clone()));
    let tasks = Arc::new(PostgresTaskRepository::new(pool.clone()));
    let outbox = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    let webhooks = Arc::new(PostgresWebhookRepository::new(pool.clone()));
    let jobs = Arc::new(PostgresJobRepository::new(pool.clone()));

    let payment_registry =
        PaymentProviderRegistry::new().register(Arc::new(SandboxPaymentProvider::new()));
    let payment_provider = payment_registry.get(&config.payment.provider_name)?;

    let commerce_registry =
        CommerceProviderRegistry::new().register(Arc::new(SandboxCommerceProvider::new()));
    let commerce_provider = commerce_registry.get(&config.commerce.provider_name)?;

    let billing = Arc::new(BillingService::new(
        subscriptions.clone(),
        invoices.clone(),
        payment_provider,
        config.task.clone(),
        config.payment.clone(),
    ));

    let fulfillment = Arc::new(FulfillmentService::new(
        subscriptions.clone(),
        invoices.clone(),
        deliveries.clone(),
        entitlements.clone(),
        commerce_provider,
        config.task.clone(),
        config.commerce.clone(),
    ));

    let lifecycle = Arc::new(LifecycleService::new(
        subscriptions.clone(),
        plans,
        customers,
        tasks.clone(),
        entitlements.clone(),
        config.task.clone(),
    ));

    let registry = Arc::new(
        HandlerRegistry::new()
            .register(
                TaskType::ProductRenewal,
                Arc::new(ProductRenewalHandler::new(billing.clone())),
            )
            .register(
                TaskType::SubscriptionRenewal,
                Arc::new(SubscriptionRenewalHandler::new(billing.clone())),
            )
            .register(
                TaskType::ChargePayment,
                Arc::new(ChargePaymentHandler::new(billing.clone())),
            )
            .register(
                TaskType::CreateDelivery,
                Arc::new(CreateDeliveryHandler::new(fulfillment.clone())),
            )
            .register(
                TaskType::CreateOrder,
                Arc::new(CreateOrderHandler::new(fulfillment.clone())),
            )
            .register(
                TaskType::EntitlementGrant,
                Arc::new(EntitlementGrantHandler::new(fulfillment.clone())),
            )
            .register(
                TaskType::TrialEnd,
                Arc::new(TrialEndHandler::new(lifecycle.clone())),
            ),
    );

    let sweeper = Arc::new(RenewalSweeper::new(
        subscriptions,
        tasks.clone(),
        entitlements,
        jobs,
        lifecycle,
        config.sweeper.clone(),
        config.task.default_max_attempts,
    ));

    let relay = Arc::new(WebhookRelay::new(outbox, webhooks, config.webhook.clone())?);

    Ok(Engine {
        pool,
        task_repo: tasks,
        registry,
        sweeper,
        relay,
        config,
    })
}
