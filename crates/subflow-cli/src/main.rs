use clap::{Parser, Subcommand};
use std::path::PathBuf;

use subflow_core::{Config, Result};

mod commands;

#[derive(Parser)]
#[command(name = "subflow")]
#[command(about = "Subflow subscription orchestration engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: task workers, renewal sweeper and webhook relay
    Run {
        #[arg(long, help = "Override the configured worker count")]
        workers: Option<usize>,

        #[arg(long, help = "Run without the renewal sweeper")]
        no_sweeper: bool,

        #[arg(long, help = "Run without the webhook relay")]
        no_relay: bool,

        #[arg(long, help = "Skip automatic database migration on startup")]
        skip_migrate: bool,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Run one sweep pass and exit
    Sweep,

    /// Task queue operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Webhook endpoint management
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },

    /// Show effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum WebhookCommands {
    /// Register an endpoint; prints the generated signing secret once
    Register {
        #[arg(help = "Tenant ID")]
        tenant: uuid::Uuid,

        #[arg(help = "Endpoint URL")]
        url: String,

        #[arg(help = "Subscribed event types", required = true)]
        events: Vec<String>,
    },

    /// List a tenant's endpoints
    List {
        #[arg(help = "Tenant ID")]
        tenant: uuid::Uuid,
    },

    /// Disable an endpoint
    Disable {
        #[arg(help = "Tenant ID")]
        tenant: uuid::Uuid,

        #[arg(help = "Endpoint ID")]
        id: uuid::Uuid,
    },
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Reset database (DANGEROUS - deletes all data)
    Reset {
        #[arg(long, help = "Skip confirmation prompt")]
        force: bool,
    },

    /// Show database status
    Status,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Show queue depth by status
    Status,

    /// Cancel a ready or claimed task by key
    Cancel {
        #[arg(help = "Tenant ID")]
        tenant: uuid::Uuid,

        #[arg(help = "Task key")]
        key: String,
    },
}

fn init_tracing(config: &Config, override_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let level = override_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("subflow={},warn", level)));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    init_tracing(&config, cli.log_level.as_deref());

    match cli.command {
        Commands::Run {
            workers,
            no_sweeper,
            no_relay,
            skip_migrate,
        } => commands::run::execute(config, workers, no_sweeper, no_relay, skip_migrate).await?,
        Commands::Db { command } => commands::db::execute(config, command).await?,
        Commands::Sweep => commands::run::sweep_once(config).await?,
        Commands::Task { command } => commands::tasks::execute(config, command).await?,
        Commands::Webhook { command } => commands::webhooks::execute(config, command).await?,
        Commands::Config => {
            println!("{:#?}", config);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path.to_str().unwrap_or_default()),
        None => Config::from_env(),
    }
}
