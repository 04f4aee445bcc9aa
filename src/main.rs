use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agora_indexer::agora::AgoraClient;
use agora_indexer::api::{self, ApiContext};
use agora_indexer::config::Config;
use agora_indexer::events::{BusEvent, EventBus, StatsView};
use agora_indexer::governance::{GovernanceEngine, MetadataClient};
use agora_indexer::ingest;
use agora_indexer::ledger::{ChainParams, Ledger};
use agora_indexer::storage::Storage;

#[derive(Parser)]
#[command(author, version, about = "Ledger indexing service for the Agora network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the indexer using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/indexer.toml")]
        config: PathBuf,
    },
    /// Generate a default configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/indexer.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
    }

    Ok(())
}

async fn start(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        let config = Config::default();
        config.save(&config_path)?;
        config
    };
    config.ensure_directories()?;

    let storage = Storage::open(&config.database.path)?;
    let governance = GovernanceEngine::new(
        config.governance.enabled,
        config.governance.grace_blocks,
    );
    let ledger = Arc::new(Ledger::new(
        storage,
        ChainParams::from_config(&config),
        governance,
    )?);
    let source = Arc::new(AgoraClient::new(
        &config.agora.endpoint,
        Duration::from_millis(config.agora.fetch_timeout_ms),
    )?);
    let bus = EventBus::default();
    let metadata = config
        .governance
        .metadata_endpoint
        .as_deref()
        .map(MetadataClient::new)
        .transpose()?
        .map(Arc::new);

    // Reconcile with the consensus tip before the intake endpoint opens;
    // an unreachable node at this point is fatal.
    ingest::catch_up(&ledger, source.as_ref(), &bus, metadata.clone()).await?;

    let (handle, worker) = ingest::spawn(
        ledger.clone(),
        source.clone(),
        bus.clone(),
        metadata,
        config.queue_warn_depth,
    );

    // Periodic stats tick so newly attached push subscribers converge
    // without waiting for the next block.
    {
        let ledger = ledger.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if let Some(tip) = ledger.tip() {
                    if let Ok(stats) = ledger.storage().stats() {
                        bus.emit(BusEvent::LatestStats {
                            stats: StatsView::from_row(tip.height, &stats),
                        });
                    }
                }
            }
        });
    }

    let context = ApiContext {
        ledger,
        ingest: handle,
        bus,
        source,
    };

    let public_addr = config.public_listen();
    let private_addr = config.private_listen();
    let public_task = {
        let context = context.clone();
        tokio::spawn(async move { api::serve_public(context, public_addr).await })
    };
    let private_task = tokio::spawn(async move { api::serve_private(context, private_addr).await });

    let result = tokio::select! {
        res = public_task => handle_join(res),
        res = private_task => handle_join(res),
        _ = worker => {
            info!("intake worker stopped");
            Ok(())
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    result?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = Config::default();
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn handle_join(
    result: Result<agora_indexer::errors::IndexerResult<()>, JoinError>,
) -> Result<()> {
    let inner = result?;
    inner?;
    Ok(())
}
