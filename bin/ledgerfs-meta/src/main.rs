//! LedgerFS Metadata Server
//!
//! The primary name node: owns the transaction log, accepts checkpoints
//! uploaded by the standby and serves log records to it.

use anyhow::{Context, Result};
use clap::Parser;
use ledgerfs_common::Config;
use ledgerfs_journal::{CheckpointReceiver, FetchService, LogFetcher, NameSystem};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ledgerfs-meta")]
#[command(about = "LedgerFS primary metadata server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/ledgerfs/meta.toml")]
    config: String,

    /// Data directory (edits, checkpoints, durable state)
    #[arg(long, env = "LEDGERFS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Checkpoint receiver listen address
    #[arg(long)]
    checkpoint_listen: Option<String>,

    /// Log fetch service listen address
    #[arg(long)]
    fetch_listen: Option<String>,

    /// Log level
    #[arg(long, env = "LEDGERFS_LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config))?;
        toml::from_str(&config_str).with_context(|| format!("failed to parse {}", args.config))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(data_dir) = &args.data_dir {
        config.storage.data_dir.clone_from(data_dir);
    }
    if let Some(addr) = &args.checkpoint_listen {
        config.checkpoint.listen_addr.clone_from(addr);
    }
    if let Some(addr) = &args.fetch_listen {
        config.replication.listen_addr.clone_from(addr);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LedgerFS Metadata Server");
    info!("Config file: {}", args.config);
    info!("Data dir: {:?}", config.storage.data_dir);

    let name_system = Arc::new(NameSystem::open(&config)?);
    let report = name_system.recovery_report();
    info!(
        "Namespace recovered at tx {} ({} records replayed from {} segments)",
        report.max_tx_id, report.applied, report.segments
    );

    let receiver = Arc::new(CheckpointReceiver::new(
        name_system.checkpoints().clone(),
        Arc::clone(name_system.state()),
        config.checkpoint.io_timeout(),
    ));
    let checkpoint_listener = TcpListener::bind(&config.checkpoint.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.checkpoint.listen_addr))?;
    let receiver_task = tokio::spawn(receiver.serve(checkpoint_listener));

    let fetch_service = Arc::new(FetchService::new(
        LogFetcher::new(
            Arc::clone(name_system.log()),
            config.replication.max_fetch_size,
        ),
        config.replication.io_timeout(),
    ));
    let fetch_listener = TcpListener::bind(&config.replication.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.replication.listen_addr))?;
    let fetch_task = tokio::spawn(fetch_service.serve(fetch_listener));

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    receiver_task.abort();
    fetch_task.abort();

    let ns = Arc::clone(&name_system);
    tokio::task::spawn_blocking(move || ns.shutdown()).await??;

    let stats = name_system.log().stats();
    info!(
        "Transaction log at tx {}: {} flushes, {} bytes, {} segments",
        stats.tx_id, stats.flush_count, stats.bytes_flushed, stats.segment_count
    );
    info!("Metadata Server shut down gracefully");
    Ok(())
}
