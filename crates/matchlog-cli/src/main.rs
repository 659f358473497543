use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use matchlog_core::resolve_queue_types;
use matchlog_sync::{run_sync_once, RunRequest, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "matchlog")]
#[command(about = "Pull a summoner's match history and refresh the match collection")]
#[command(version)]
struct Cli {
    /// Summoner name to look up
    #[arg(short, long)]
    summoner: String,

    /// Queue types to pull: draft, blind, aram
    #[arg(short, long = "queue-type", num_args = 1.., required = true)]
    queue_types: Vec<String>,

    /// Database holding the match collection
    #[arg(long)]
    db: Option<String>,

    /// Collection (table) to replace
    #[arg(long)]
    collection: Option<String>,

    /// Max match requests in flight at once
    #[arg(long)]
    rate_limit: Option<usize>,

    /// File holding the API token
    #[arg(long)]
    api_key_path: Option<PathBuf>,

    /// Postgres connection string
    #[arg(long)]
    database_url: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(db) = &self.db {
            config.database = db.clone();
        }
        if let Some(collection) = &self.collection {
            config.collection = collection.clone();
        }
        if let Some(rate_limit) = self.rate_limit {
            config.rate_limit = rate_limit;
        }
        if let Some(path) = &self.api_key_path {
            config.api_key_path = path.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
    }
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matchlog=info,matchlog_sync=info,matchlog_adapters=info,matchlog_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_ref())?;

    let queue_types = resolve_queue_types(&cli.queue_types)?;
    let mut config = SyncConfig::from_env()?;
    cli.apply(&mut config);
    info!(
        summoner = %cli.summoner,
        queues = ?queue_types,
        collection = %config.collection,
        "starting match sync"
    );

    let summary = run_sync_once(
        config,
        RunRequest {
            summoner: cli.summoner.clone(),
            queue_types,
        },
    )
    .await?;

    println!(
        "sync complete: run_id={} matches={} fetched={} failed={} inserted={} deleted={}",
        summary.run_id,
        summary.match_ids,
        summary.fetched_ok,
        summary.fetch_failed,
        summary.inserted,
        summary.deleted
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
