//! Lifecycle task handlers

use async_trait::async_trait;
use std::sync::Arc;

use crate::lifecycle::LifecycleService;
use crate::models::{task_payload, ScheduledTask};
use crate::tasks::{HandlerOutcome, TaskHandler};
use crate::tenant::TenantContext;
use crate::Error;

/// trial_end -> LifecycleService::trial_end
pub struct TrialEndHandler {
    lifecycle: Arc<LifecycleService>,
}

impl TrialEndHandler {
    pub fn new(lifecycle: Arc<LifecycleService>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl TaskHandler for TrialEndHandler {
    async fn handle(&self, ctx: &TenantContext, task: &ScheduledTask) -> HandlerOutcome {
        let payload: task_payload::TrialEnd = match serde_json::from_value(task.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return HandlerOutcome::Terminal(format!("Bad trial payload: {}", e)),
        };

        match self.lifecycle.trial_end(ctx, payload.subscription_id).await {
            // None: already out of trial; the transition happened elsewhere
            Ok(_) => HandlerOutcome::Success,
            // Fired before the trial lapsed (clock skew); try again shortly
            Err(Error::Validation(msg)) if msg.contains("not ended") => {
                HandlerOutcome::Transient(msg)
            }
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}
