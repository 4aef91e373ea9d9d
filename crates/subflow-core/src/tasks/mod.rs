//! Background task processing
//!
//! The dispatcher claims due tasks from the persistent queue and routes them
//! through a handler table registered at startup. Handlers communicate
//! through result values, never exceptions: a handler returns success,
//! transient failure (rescheduled with backoff) or terminal failure (kept
//! for operator attention). Nothing a handler does can take down the worker
//! loop.

pub mod dispatcher;
pub mod metrics;
pub mod retry;

pub use dispatcher::{Dispatcher, DispatcherState};
pub use metrics::{DispatcherMetrics, MetricsSummary};
pub use retry::ExponentialBackoff;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{ScheduledTask, TaskType};
use crate::tenant::TenantContext;
use crate::Error;

/// What a handler run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Work done (or already done by an earlier run); complete the task
    Success,
    /// Retryable failure; the task goes back to ready with backoff
    Transient(String),
    /// Unrecoverable failure; the task is failed immediately
    Terminal(String),
}

impl HandlerOutcome {
    /// Classify an error that escaped a handler's flow
    pub fn from_error(error: &Error) -> Self {
        if error.is_transient() {
            HandlerOutcome::Transient(error.to_string())
        } else {
            HandlerOutcome::Terminal(error.to_string())
        }
    }
}

/// A task handler. The dispatcher builds the tenant context from the task
/// row before calling; handlers must be idempotent, since a crashed worker's
/// lease lapse replays the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome;
}

/// Handler table keyed by task type.
///
/// Built once at startup by the binary; billing, fulfillment and lifecycle
/// register their handlers here, which keeps the dispatcher free of any
/// dependency on them.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _ctx: &TenantContext, _task: &ScheduledTask) -> HandlerOutcome {
            HandlerOutcome::Success
        }
    }

    #[test]
    fn test_registry_routes_by_type() {
        let registry = HandlerRegistry::new()
            .register(TaskType::ChargePayment, Arc::new(NoopHandler))
            .register(TaskType::CreateDelivery, Arc::new(NoopHandler));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(TaskType::ChargePayment).is_some());
        assert!(registry.get(TaskType::TrialEnd).is_none());
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let registry = HandlerRegistry::new().register(TaskType::TrialEnd, Arc::new(NoopHandler));
        let handler = registry.get(TaskType::TrialEnd).unwrap();

        let now = Utc::now();
        let task = ScheduledTask {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            task_type: TaskType::TrialEnd,
            task_key: "trial_end_test".to_string(),
            status: crate::models::TaskStatus::Claimed,
            due_at: now,
            attempt_count: 0,
            max_attempts: 3,
            payload: serde_json::json!({}),
            locked_until: Some(now),
            lock_owner: Some("worker-1".to_string()),
            last_error: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let ctx = TenantContext::system(task.tenant_id);
        assert_eq!(handler.handle(&ctx, &task).await, HandlerOutcome::Success);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(
            HandlerOutcome::from_error(&Error::network("timeout")),
            HandlerOutcome::Transient(_)
        ));
        assert!(matches!(
            HandlerOutcome::from_error(&Error::not_found("plan")),
            HandlerOutcome::Terminal(_)
        ));
    }
}
