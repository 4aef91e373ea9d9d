//! `subflow db`: migration and status commands

use subflow_core::{Config, Migrator, Result};

use crate::DbCommands;

pub async fn execute(config: Config, command: DbCommands) -> Result<()> {
    let pool = subflow_core::create_pool(&config.database).await?;
    let migrator = Migrator::new(pool);

    match command {
        DbCommands::Migrate => {
            migrator.migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Reset { force } => {
            if !force {
                return Err(subflow_core::Error::validation(
                    "Refusing to reset without --force; this deletes all data",
                ));
            }
            migrator.reset().await?;
            println!("Database reset");
        }
        DbCommands::Status => {
            let status = migrator.status().await?;
            println!("Applied migrations:   {}", status.applied_migrations);
            println!("Subscriptions:        {}", status.subscription_count);
            println!("Ready tasks:          {}", status.ready_task_count);
            println!("Failed tasks:         {}", status.failed_task_count);
            println!("Unpublished events:   {}", status.unpublished_event_count);
        }
    }

    Ok(())
}
