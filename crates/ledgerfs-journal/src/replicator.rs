//! Standby pull loop
//!
//! Repeatedly asks a [`LogSource`] for the records after the local
//! watermark and replays them in received order, relogging each one into
//! the standby's own transaction log.

use crate::namesystem::NameSystem;
use crate::net::{blocking, sleep_unless};
use crate::op::LogRecord;
use crate::recovery::ReplaySequence;
use async_trait::async_trait;
use ledgerfs_common::{Error, ReplayMode, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where the standby pulls records from
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Up to `max` records with ids greater than `synced_tx_id`, ascending.
    /// An empty batch means nothing is available right now.
    async fn fetch(&self, synced_tx_id: u64, max: usize) -> Result<Vec<LogRecord>>;
}

/// Pulls and replays records until shut down
pub struct LogReplicator {
    name_system: Arc<NameSystem>,
    source: Arc<dyn LogSource>,
    max_fetch_size: usize,
    backoff: Duration,
    mode: ReplayMode,
}

impl LogReplicator {
    pub fn new(
        name_system: Arc<NameSystem>,
        source: Arc<dyn LogSource>,
        max_fetch_size: usize,
        backoff: Duration,
    ) -> Self {
        let mode = name_system.config().journal.replay_mode;
        Self {
            name_system,
            source,
            max_fetch_size: max_fetch_size.max(1),
            backoff,
            mode,
        }
    }

    /// Fetch one batch and replay it. Returns the number of records fetched.
    pub async fn sync_once(&self) -> Result<usize> {
        let synced_tx_id = self.name_system.synced_tx_id();
        let records = self.source.fetch(synced_tx_id, self.max_fetch_size).await?;
        let fetched = records.len();
        if fetched == 0 {
            return Ok(0);
        }

        let ns = Arc::clone(&self.name_system);
        let mode = self.mode;
        let applied = blocking(move || {
            let mut sequence = ReplaySequence::new(ns.synced_tx_id(), mode);
            let mut applied = 0usize;
            for record in &records {
                if sequence.admit(record.tx_id)? {
                    ns.replay(record, true)?;
                    applied += 1;
                }
            }
            Ok(applied)
        })
        .await?;

        debug!(
            "Replicated {} of {} records after tx {}, now at tx {}",
            applied,
            fetched,
            synced_tx_id,
            self.name_system.synced_tx_id()
        );
        Ok(fetched)
    }

    /// Pull until `shutdown` is set.
    ///
    /// Empty or short batches back off before the next request. Transient
    /// failures are logged and retried; fatal ones end the loop.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            "Log replicator started at tx {}, batch size {}",
            self.name_system.synced_tx_id(),
            self.max_fetch_size
        );

        while !shutdown.load(Ordering::Relaxed) {
            let pause = match self.sync_once().await {
                Ok(fetched) if fetched < self.max_fetch_size => {
                    debug!(
                        "Short batch ({} < {}), backing off {:?}",
                        fetched, self.max_fetch_size, self.backoff
                    );
                    true
                }
                Ok(_) => false,
                Err(Error::ShuttingDown) => break,
                Err(e) if e.is_fatal() => {
                    error!("Log replicator stopping: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Log fetch failed, backing off: {}", e);
                    true
                }
            };

            if pause && !sleep_unless(&shutdown, self.backoff).await {
                break;
            }
        }

        info!(
            "Log replicator stopped at tx {}",
            self.name_system.synced_tx_id()
        );
        Ok(())
    }
}
