//! `subflow task`: queue inspection and cancellation

use std::sync::Arc;

use subflow_core::repository::{PostgresTaskRepository, TaskRepository};
use subflow_core::tasks::metrics::format_status_counts;
use subflow_core::{Config, Result, TenantContext};

use crate::TaskCommands;

pub async fn execute(config: Config, command: TaskCommands) -> Result<()> {
    let pool = subflow_core::create_pool(&config.database).await?;
    let tasks: Arc<dyn TaskRepository> = Arc::new(PostgresTaskRepository::new(pool));

    match command {
        TaskCommands::Status => {
            let counts = tasks.count_by_status().await?;
            if counts.is_empty() {
                println!("Queue is empty");
            } else {
                println!("{}", format_status_counts(&counts));
            }
        }
        TaskCommands::Cancel { tenant, key } => {
            let ctx = TenantContext::system(tenant);
            if tasks.cancel(&ctx, &key).await? {
                println!("Task '{}' cancelled", key);
            } else {
                println!("No ready or claimed task '{}' for tenant {}", key, tenant);
            }
        }
    }

    Ok(())
}
