//! `subflow run`: the long-running engine process

use std::sync::Arc;
use tracing::info;

use subflow_core::{Config, Dispatcher, Result};

use super::build_engine;

pub async fn execute(
    mut config: Config,
    workers: Option<usize>,
    no_sweeper: bool,
    no_relay: bool,
    skip_migrate: bool,
) -> Result<()> {
    if let Some(workers) = workers {
        config.task.worker_count = workers;
    }
    config.validate()?;

    let engine = build_engine(config).await?;

    if skip_migrate {
        info!("Skipping automatic migration");
    } else {
        subflow_core::auto_migrate(&engine.pool).await?;
    }

    let dispatcher = Arc::new(Dispatcher::new(
        engine.task_repo.clone(),
        engine.registry.clone(),
        engine.config.task.clone(),
    ));

    let mut handles = dispatcher.clone().start().await?;

    if no_sweeper {
        info!("Renewal sweeper disabled");
    } else {
        handles.push(engine.sweeper.clone().start());
    }

    if no_relay {
        info!("Webhook relay disabled");
    } else {
        handles.push(engine.relay.clone().start());
    }

    info!(
        version = subflow_core::VERSION,
        workers = engine.config.task.worker_count,
        "Engine running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(subflow_core::Error::Io)?;

    info!("Shutting down");
    dispatcher.stop().await;
    for handle in handles {
        handle.abort();
    }

    let metrics = dispatcher.metrics().summary();
    info!("Dispatcher totals: {}", metrics.format());

    Ok(())
}

/// `subflow sweep`: one sweep pass, then exit
pub async fn sweep_once(config: Config) -> Result<()> {
    config.validate()?;
    let engine = build_engine(config).await?;

    let run = engine.sweeper.run_once().await?;
    println!(
        "Sweep finished: found={}, tasks_created={}, trial_ends={}, period_ends={}, errors={}",
        run.subscriptions_found,
        run.tasks_created,
        run.trial_ends_scheduled,
        run.period_ends_processed,
        run.errors
    );

    Ok(())
}
