//! LedgerFS Backup Server
//!
//! The standby name node: pulls log records from the primary, replays them
//! into its own namespace and periodically uploads checkpoints back.

use anyhow::{Context, Result};
use clap::Parser;
use ledgerfs_common::Config;
use ledgerfs_journal::{
    CheckpointProducer, CheckpointUploader, LogReplicator, NameSystem, RemoteLogSource,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ledgerfs-backup")]
#[command(about = "LedgerFS standby checkpoint server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/ledgerfs/backup.toml")]
    config: String,

    /// Data directory (edits, checkpoints, durable state)
    #[arg(long, env = "LEDGERFS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Primary fetch service address
    #[arg(long)]
    fetch_primary: Option<String>,

    /// Primary checkpoint receiver address
    #[arg(long)]
    checkpoint_primary: Option<String>,

    /// Seconds between checkpoints
    #[arg(long)]
    checkpoint_interval: Option<u64>,

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
    if let Some(addr) = &args.fetch_primary {
        config.replication.primary_addr.clone_from(addr);
    }
    if let Some(addr) = &args.checkpoint_primary {
        config.checkpoint.primary_addr.clone_from(addr);
    }
    if let Some(secs) = args.checkpoint_interval {
        config.checkpoint.interval_secs = secs;
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

    info!("Starting LedgerFS Backup Server");
    info!("Config file: {}", args.config);
    info!("Data dir: {:?}", config.storage.data_dir);
    info!(
        "Primary: fetch {}, checkpoint {}",
        config.replication.primary_addr, config.checkpoint.primary_addr
    );

    let name_system = Arc::new(NameSystem::open(&config)?);
    info!("Namespace recovered at tx {}", name_system.synced_tx_id());

    let shutdown = Arc::new(AtomicBool::new(false));

    let replicator = LogReplicator::new(
        Arc::clone(&name_system),
        Arc::new(RemoteLogSource::new(
            config.replication.primary_addr.clone(),
            config.replication.io_timeout(),
        )),
        config.replication.max_fetch_size,
        config.replication.backoff(),
    );
    let mut replicator_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { replicator.run(shutdown).await })
    };

    let producer = CheckpointProducer::new(
        Arc::clone(&name_system),
        CheckpointUploader::new(
            config.checkpoint.primary_addr.clone(),
            config.checkpoint.io_timeout(),
        ),
        config.checkpoint.interval(),
    );
    let mut producer_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { producer.run(shutdown).await })
    };

    // Either ctrl-c or a loop that stopped on a fatal error ends the process
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
        result = &mut replicator_task => report_exit("Log replicator", result),
        result = &mut producer_task => report_exit("Checkpoint producer", result),
    }

    // Loops finish their current cycle before observing the flag
    shutdown.store(true, Ordering::Relaxed);
    if !replicator_task.is_finished() {
        report_exit("Log replicator", replicator_task.await);
    }
    if !producer_task.is_finished() {
        report_exit("Checkpoint producer", producer_task.await);
    }

    let ns = Arc::clone(&name_system);
    tokio::task::spawn_blocking(move || ns.shutdown()).await??;

    let stats = name_system.log().stats();
    info!(
        "Transaction log at tx {}: {} flushes, {} bytes, {} segments",
        stats.tx_id, stats.flush_count, stats.bytes_flushed, stats.segment_count
    );
    info!("Backup Server shut down gracefully");
    Ok(())
}

fn report_exit(
    name: &str,
    result: std::result::Result<ledgerfs_common::Result<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => info!("{name} stopped"),
        Ok(Err(e)) => error!("{name} failed: {e}"),
        Err(e) => error!("{name} task panicked: {e}"),
    }
}
