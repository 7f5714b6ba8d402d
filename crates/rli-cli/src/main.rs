use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rli_sync::{run_migrations, run_scheduled, SyncConfig, SyncPipeline};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rli-cli")]
#[command(about = "Pages a listing endpoint into the raw_listing table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion (default). Reports items seen, rows upserted and
    /// items skipped for lacking an id/uuid/pk.
    Sync,
    /// Create or update the raw_listing table.
    Migrate,
    /// Run ingestion on SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli.command.unwrap_or(Commands::Sync)).await;
    if let Err(err) = &result {
        let message = format!("{err:#}");
        error!(error = %message, "rli-cli failed");
    }
    result
}

async fn run(command: Commands) -> Result<()> {
    let config = SyncConfig::from_env();

    match command {
        Commands::Sync => {
            let summary = SyncPipeline::new(config).run_once().await?;
            println!(
                "sync complete: run_id={} pages={} items={} upserted={} skipped={}",
                summary.run_id,
                summary.pages_fetched,
                summary.items_seen(),
                summary.upserted,
                summary.skipped
            );
        }
        Commands::Migrate => {
            run_migrations(&config.database).await?;
            println!("migrations applied: {}", config.database.target());
        }
        Commands::Schedule => {
            run_scheduled(Arc::new(SyncPipeline::new(config))).await?;
        }
    }

    Ok(())
}
