//! Renewal sweeper
//!
//! Periodically scans all tenants for subscriptions whose renewal time has
//! passed and enqueues their renewal tasks; duplicate sweeps collapse on the
//! task keys. The same pass handles the other clock-driven transitions:
//! overdue trials, deferred cancellations whose period lapsed, contracts
//! that never renewed, and entitlements past their validity window.
//!
//! The schedule is a cron expression read from the job_configs table on
//! every pass (falling back to the static configuration), so operators can
//! retune it without a redeploy.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::SweeperConfig;
use crate::lifecycle::LifecycleService;
use crate::models::{task_key, task_payload, NewTask, TaskType};
use crate::repository::{
    EntitlementRepository, JobRepository, SubscriptionRepository, SweeperRunRecord, TaskRepository,
};
use crate::tenant::TenantContext;
use crate::Result;

/// Job name under which the sweeper's schedule is stored
pub const SWEEPER_JOB_NAME: &str = "renewal_sweeper";

/// Renewal sweeper
pub struct RenewalSweeper {
    subscriptions: Arc<dyn SubscriptionRepository>,
    tasks: Arc<dyn TaskRepository>,
    entitlements: Arc<dyn EntitlementRepository>,
    jobs: Arc<dyn JobRepository>,
    lifecycle: Arc<LifecycleService>,
    config: SweeperConfig,
    task_max_attempts: i32,
}

impl RenewalSweeper {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        tasks: Arc<dyn TaskRepository>,
        entitlements: Arc<dyn EntitlementRepository>,
        jobs: Arc<dyn JobRepository>,
        lifecycle: Arc<LifecycleService>,
        config: SweeperConfig,
        task_max_attempts: i32,
    ) -> Self {
        Self {
            subscriptions,
            tasks,
            entitlements,
            jobs,
            lifecycle,
            config,
            task_max_attempts,
        }
    }

    /// Run on the configured cron schedule until the process exits
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Renewal sweeper running");
            loop {
                let (schedule, enabled) = self.current_schedule().await;

                if !enabled {
                    info!("Sweeper disabled; checking again in 60s");
                    sleep(Duration::from_secs(60)).await;
                    continue;
                }

                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!("Sweeper schedule yields no upcoming fire time; retrying in 60s");
                    sleep(Duration::from_secs(60)).await;
                    continue;
                };

                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep(wait).await;

                match self.run_once().await {
                    Ok(run) => {
                        info!(
                            found = run.subscriptions_found,
                            tasks_created = run.tasks_created,
                            trial_ends = run.trial_ends_scheduled,
                            period_ends = run.period_ends_processed,
                            errors = run.errors,
                            "Sweep finished"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        })
    }

    /// Current schedule: the job_configs row wins, the static configuration
    /// is the fallback
    async fn current_schedule(&self) -> (cron::Schedule, bool) {
        let fallback = || {
            self.config
                .schedule
                .parse::<cron::Schedule>()
                .expect("sweeper.schedule validated at startup")
        };

        match self.jobs.get_config(SWEEPER_JOB_NAME).await {
            Ok(Some(row)) => match row.schedule.parse::<cron::Schedule>() {
                Ok(schedule) => (schedule, row.enabled),
                Err(e) => {
                    warn!(
                        schedule = %row.schedule,
                        error = %e,
                        "Invalid schedule in job_configs; using configured default"
                    );
                    (fallback(), true)
                }
            },
            Ok(None) => (fallback(), true),
            Err(e) => {
                warn!(error = %e, "Could not read job_configs; using configured default");
                (fallback(), true)
            }
        }
    }

    /// One sweep across all tenants. Each phase is independent; an error on
    /// one subscription is counted and the sweep moves on.
    pub async fn run_once(&self) -> Result<SweeperRunRecord> {
        let mut run = SweeperRunRecord {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        self.sweep_renewals(&mut run).await;
        self.sweep_trials(&mut run).await;
        self.sweep_period_end_cancellations(&mut run).await;
        self.sweep_expiry(&mut run).await;
        self.sweep_lapsed_entitlements(&mut run).await;

        run.finished_at = Some(Utc::now());
        if let Err(e) = self.jobs.record_sweeper_run(&run).await {
            warn!(error = %e, "Could not record sweeper run");
        }

        Ok(run)
    }

    async fn sweep_renewals(&self, run: &mut SweeperRunRecord) {
        let mut cursor = None;

        loop {
            let page = match self
                .subscriptions
                .find_due_for_renewal_all_tenants(cursor, self.config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, "Renewal scan failed");
                    run.errors += 1;
                    return;
                }
            };

            let page_len = page.len() as i64;
            run.subscriptions_found += page_len;

            for subscription in &page {
                // Re-bind to the row's tenant before any scoped work.
                let ctx = TenantContext::system(subscription.tenant_id);
                match self.lifecycle.enqueue_renewals(&ctx, subscription).await {
                    Ok(created) => run.tasks_created += created as i64,
                    Err(e) => {
                        error!(
                            subscription_id = %subscription.id,
                            error = %e,
                            "Could not enqueue renewal"
                        );
                        run.errors += 1;
                    }
                }
            }

            cursor = page.last().map(|s| (s.next_renewal_at, s.id));
            if page_len < self.config.batch_size {
                break;
            }
        }
    }

    async fn sweep_trials(&self, run: &mut SweeperRunRecord) {
        let due = match self
            .subscriptions
            .find_due_trials_all_tenants(self.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Trial scan failed");
                run.errors += 1;
                return;
            }
        };

        for subscription in due {
            let ctx = TenantContext::system(subscription.tenant_id);
            let task = NewTask::new(
                TaskType::TrialEnd,
                task_key::trial_end(subscription.id),
                Utc::now(),
                self.task_max_attempts,
                match serde_json::to_value(task_payload::TrialEnd {
                    subscription_id: subscription.id,
                }) {
                    Ok(payload) => payload,
                    Err(e) => {
                        run.errors += 1;
                        error!(error = %e, "Trial payload serialization failed");
                        continue;
                    }
                },
            );

            match self.tasks.enqueue(&ctx, task).await {
                Ok(Some(_)) => run.trial_ends_scheduled += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Could not enqueue trial end");
                    run.errors += 1;
                }
            }
        }
    }

    async fn sweep_period_end_cancellations(&self, run: &mut SweeperRunRecord) {
        let due = match self
            .subscriptions
            .find_period_end_cancellations_all_tenants(self.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Period-end cancellation scan failed");
                run.errors += 1;
                return;
            }
        };

        for subscription in due {
            let ctx = TenantContext::system(subscription.tenant_id);
            match self
                .lifecycle
                .execute_period_end_cancellation(&ctx, subscription.id)
                .await
            {
                Ok(Some(_)) => run.period_ends_processed += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Deferred cancellation failed");
                    run.errors += 1;
                }
            }
        }
    }

    async fn sweep_expiry(&self, run: &mut SweeperRunRecord) {
        let grace = chrono::Duration::hours(self.config.expire_grace_hours);
        let candidates = match self
            .subscriptions
            .find_expiry_candidates_all_tenants(grace, self.config.batch_size)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Expiry scan failed");
                run.errors += 1;
                return;
            }
        };

        for subscription in candidates {
            let ctx = TenantContext::system(subscription.tenant_id);

            // Only expire once renewal work is truly dead: a ready or
            // claimed renewal task means the contract may still roll
            // forward.
            match self.has_pending_renewal(&ctx, &subscription).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Renewal task lookup failed");
                    run.errors += 1;
                    continue;
                }
            }

            match self.lifecycle.expire(&ctx, subscription.id).await {
                Ok(Some(_)) => run.period_ends_processed += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Expiry failed");
                    run.errors += 1;
                }
            }
        }
    }

    async fn has_pending_renewal(
        &self,
        ctx: &TenantContext,
        subscription: &crate::models::Subscription,
    ) -> Result<bool> {
        use crate::models::TaskStatus;

        let mut keys = vec![task_key::subscription_renewal(subscription.id)];
        for item in self.subscriptions.items(ctx, subscription.id).await? {
            keys.push(task_key::product_renewal(subscription.id, item.product_id));
        }

        for key in keys {
            if let Some(task) = self.tasks.find_by_key(ctx, &key).await? {
                if matches!(task.status, TaskStatus::Ready | TaskStatus::Claimed) {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    async fn sweep_lapsed_entitlements(&self, run: &mut SweeperRunRecord) {
        match self
            .entitlements
            .expire_lapsed_all_tenants(self.config.batch_size)
            .await
        {
            Ok(expired) if expired > 0 => {
                info!(count = expired, "Expired lapsed entitlements");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Entitlement expiry failed");
                run.errors += 1;
            }
        }
    }
}
