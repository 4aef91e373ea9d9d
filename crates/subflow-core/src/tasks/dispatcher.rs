//! Task dispatcher: the worker pool that drives every asynchronous flow
//!
//! Each worker loops: claim a batch of due tasks, process each under the
//! tenant context taken from the task row, mark completed or failed. A
//! separate reaper loop returns lapsed claims to ready so a crashed worker's
//! work is picked up by another. Concurrency control is entirely in the
//! claim SQL; workers share nothing but the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::models::ScheduledTask;
use crate::repository::TaskRepository;
use crate::tasks::{DispatcherMetrics, ExponentialBackoff, HandlerOutcome, HandlerRegistry};
use crate::tenant::TenantContext;
use crate::Result;

/// Dispatcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    Stopping,
    Stopped,
}

/// Worker pool over the persistent task queue
pub struct Dispatcher {
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    config: TaskConfig,
    backoff: ExponentialBackoff,
    metrics: Arc<DispatcherMetrics>,
    state: Arc<RwLock<DispatcherState>>,
}

impl Dispatcher {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<HandlerRegistry>,
        config: TaskConfig,
    ) -> Self {
        let backoff = ExponentialBackoff::from_base_seconds(config.backoff_base_seconds);
        Self {
            task_repo,
            registry,
            config,
            backoff,
            metrics: Arc::new(DispatcherMetrics::new()),
            state: Arc::new(RwLock::new(DispatcherState::Running)),
        }
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        self.metrics.clone()
    }

    /// Start the worker pool and the reaper; returns their join handles
    pub async fn start(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        info!(
            workers = self.config.worker_count,
            handlers = self.registry.len(),
            "Starting task dispatcher"
        );

        let mut handles = Vec::with_capacity(self.config.worker_count + 1);

        for n in 0..self.config.worker_count {
            let dispatcher = self.clone();
            let worker_id = format!("worker-{}-{}", n, Uuid::new_v4());
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id).await;
            }));
        }

        let dispatcher = self.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.reaper_loop().await;
        }));

        Ok(handles)
    }

    /// Signal all loops to finish their current pass and exit
    pub async fn stop(&self) {
        info!("Stopping task dispatcher");
        *self.state.write().await = DispatcherState::Stopping;
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == DispatcherState::Running
    }

    async fn worker_loop(&self, worker_id: String) {
        info!(worker = %worker_id, "Worker running");

        while self.is_running().await {
            let batch = self
                .task_repo
                .claim_batch(
                    &worker_id,
                    self.config.batch_size,
                    Duration::from_secs(self.config.lease_seconds),
                )
                .await;

            match batch {
                Ok(tasks) if tasks.is_empty() => {
                    sleep(Duration::from_secs(self.config.poll_interval_seconds)).await;
                }
                Ok(tasks) => {
                    debug!(worker = %worker_id, count = tasks.len(), "Claimed batch");
                    // Tasks in a batch are independent by construction (each
                    // task_key appears at most once), so process concurrently
                    futures::future::join_all(
                        tasks
                            .into_iter()
                            .map(|task| self.process_task(&worker_id, task)),
                    )
                    .await;
                }
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "Claim failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker = %worker_id, "Worker stopped");
    }

    /// Process one claimed task: bind the tenant context from the row, route
    /// by type, translate the outcome into queue state.
    async fn process_task(&self, worker_id: &str, task: ScheduledTask) {
        let ctx = TenantContext::system(task.tenant_id);

        debug!(
            worker = %worker_id,
            task = %task.task_key,
            task_type = %task.task_type,
            attempt = task.attempt_count + 1,
            max_attempts = task.max_attempts,
            "Processing task"
        );

        let outcome = match self.registry.get(task.task_type) {
            Some(handler) => handler.handle(&ctx, &task).await,
            None => HandlerOutcome::Terminal(format!("No handler for task type {}", task.task_type)),
        };

        match outcome {
            HandlerOutcome::Success => {
                if let Err(e) = self.task_repo.complete(task.id).await {
                    error!(task = %task.task_key, error = %e, "Failed to complete task");
                    return;
                }
                self.metrics.record_success(task.task_type);
            }
            HandlerOutcome::Transient(reason) => {
                let delay = self.backoff.calculate_delay(task.attempt_count as u32 + 1);
                match self.task_repo.fail(task.id, &reason, delay).await {
                    Ok(Some(updated)) if updated.status == crate::models::TaskStatus::Failed => {
                        warn!(
                            task = %task.task_key,
                            attempts = updated.attempt_count,
                            reason = %reason,
                            "Task attempts exhausted"
                        );
                        self.metrics.record_failure(task.task_type);
                    }
                    Ok(_) => {
                        debug!(task = %task.task_key, delay_secs = delay.as_secs(), reason = %reason, "Task rescheduled");
                        self.metrics.record_retry(task.task_type);
                    }
                    Err(e) => {
                        error!(task = %task.task_key, error = %e, "Failed to reschedule task");
                    }
                }
            }
            HandlerOutcome::Terminal(reason) => {
                warn!(task = %task.task_key, reason = %reason, "Task failed terminally");
                if let Err(e) = self.task_repo.fail_terminal(task.id, &reason).await {
                    error!(task = %task.task_key, error = %e, "Failed to record terminal failure");
                    return;
                }
                self.metrics.record_failure(task.task_type);
            }
        }
    }

    /// Recover claims whose lease lapsed (worker crash or stall)
    async fn reaper_loop(&self) {
        info!("Reaper running");

        while self.is_running().await {
            match self.task_repo.reap_expired(self.config.batch_size).await {
                Ok(0) => {}
                Ok(reaped) => {
                    warn!(count = reaped, "Reaped expired task leases");
                    self.metrics.record_reaped(reaped);
                }
                Err(e) => {
                    error!(error = %e, "Reap pass failed");
                }
            }
            sleep(Duration::from_secs(self.config.reap_interval_seconds)).await;
        }

        info!("Reaper stopped");
    }
}
