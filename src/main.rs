use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chainscout::{
    config::Config,
    database::Database,
    handlers::{builtin_handlers, EventBus},
    jobs::{
        scheduler::{JobScheduler, JobTemplates},
        JobManager,
    },
    services::{EvmExplorer, HttpEmbeddingClient, HttpSourceFetcher, ImmunefiClient},
};

#[derive(Parser)]
#[command(name = "chainscout")]
#[command(version = "0.1.0")]
#[command(about = "Security-research automation: bounty indexing and contract monitoring")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("chainscout={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting chainscout v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    info!("Using database: {}", config.database.url);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    let event_bus = EventBus::new();
    for factory in builtin_handlers(&database) {
        event_bus.register_handler(factory).await;
    }
    info!("Event handlers registered");

    let manager = JobManager::new(database.clone(), event_bus.clone());

    let explorer = Arc::new(EvmExplorer::new(&config.explorer)?);
    let fetcher = Arc::new(HttpSourceFetcher::new(&config.explorer)?);
    let embedder = Arc::new(HttpEmbeddingClient::new(&config.embeddings)?);
    let platform = Arc::new(ImmunefiClient::new()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.scheduler.enabled {
        let templates =
            JobTemplates::from_config(&config, explorer, fetcher, embedder, platform);
        let scheduler =
            JobScheduler::new(manager.clone(), &config.scheduler, templates, shutdown_rx)?;
        tokio::spawn(async move {
            if let Err(e) = scheduler.start().await {
                tracing::error!("Job scheduler failed: {:#}", e);
            }
        });
    } else {
        info!("Scheduler disabled by configuration");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    manager.stop_all().await;
    info!("All jobs stopped, exiting");

    Ok(())
}
