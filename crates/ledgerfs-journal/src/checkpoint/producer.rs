//! Standby-side periodic checkpointing
//!
//! Each cycle persists a fresh snapshot locally behind a `.last` backup,
//! uploads it to the primary and only then advances the local checkpoint
//! watermark. A failed cycle leaves the watermark where it was, so the next
//! tick starts again from a consistent state.

use super::store::CheckpointId;
use super::uploader::CheckpointUploader;
use crate::namesystem::NameSystem;
use crate::net::{blocking, sleep_unless};
use ledgerfs_common::Result;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timer-driven checkpoint producer
pub struct CheckpointProducer {
    name_system: Arc<NameSystem>,
    uploader: CheckpointUploader,
    interval: Duration,
}

impl CheckpointProducer {
    pub fn new(name_system: Arc<NameSystem>, uploader: CheckpointUploader, interval: Duration) -> Self {
        Self {
            name_system,
            uploader,
            interval,
        }
    }

    /// Run one checkpoint cycle.
    ///
    /// Returns the new checkpoint id, or `None` when nothing changed since
    /// the last one.
    pub async fn run_once(&self) -> Result<Option<CheckpointId>> {
        let start = Instant::now();

        let ns = Arc::clone(&self.name_system);
        let prepared = blocking(move || {
            ns.persist()?;
            let previous = ns.state().last_checkpoint();
            let Some(snapshot) = ns.snapshot()? else {
                return Ok(None);
            };
            ns.checkpoints().rotate(previous)?;
            ns.checkpoints().write(&snapshot)?;
            Ok(Some((previous, snapshot)))
        })
        .await?;

        let Some((previous, snapshot)) = prepared else {
            debug!("No transactions since the last checkpoint, skipping");
            return Ok(None);
        };
        let id = (snapshot.max_tx_id, snapshot.timestamp);

        self.uploader.upload(&snapshot).await?;

        let ns = Arc::clone(&self.name_system);
        blocking(move || {
            let checkpoints = ns.checkpoints();
            checkpoints.discard_backup(previous)?;
            ns.state().update(|s| {
                s.last_checkpoint_max_tx_id = id.0;
                s.last_checkpoint_timestamp = id.1;
            });
            ns.state().persist()?;
            checkpoints.prune(id)?;
            Ok(())
        })
        .await?;

        info!(
            "Checkpoint at tx {} completed in {:?}",
            id.0,
            start.elapsed()
        );
        Ok(Some(id))
    }

    /// Produce checkpoints every interval until `shutdown` is set.
    ///
    /// Fatal errors end the loop. Everything else is retried next tick.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            "Checkpoint producer started, interval {:?}, primary {}",
            self.interval,
            self.uploader.addr()
        );

        while sleep_unless(&shutdown, self.interval).await {
            match self.run_once().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("Checkpoint producer stopping: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Checkpoint cycle failed, retrying next interval: {}", e),
            }
        }

        info!("Checkpoint producer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::receiver::CheckpointReceiver;
    use crate::checkpoint::store::CheckpointStore;
    use crate::state::StateStore;
    use ledgerfs_common::Config;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn open_standby(dir: &std::path::Path) -> Arc<NameSystem> {
        let mut config = Config::with_data_dir(dir);
        config.journal.background_cleaner = false;
        Arc::new(NameSystem::open(&config).unwrap())
    }

    #[tokio::test]
    async fn test_cycle_skips_when_unchanged() {
        let dir = tempdir().unwrap();
        let ns = open_standby(dir.path());
        let uploader = CheckpointUploader::new("127.0.0.1:1", Duration::from_secs(1));
        let producer = CheckpointProducer::new(ns, uploader, Duration::from_secs(60));
        assert_eq!(producer.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_watermark() {
        let dir = tempdir().unwrap();
        let ns = open_standby(dir.path());
        ns.mkdir("/a").unwrap();

        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let uploader = CheckpointUploader::new(addr.to_string(), Duration::from_secs(1));
        let producer = CheckpointProducer::new(Arc::clone(&ns), uploader, Duration::from_secs(60));

        let err = producer.run_once().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ns.state().last_checkpoint(), (0, 0));
        // The image is on disk but not yet recorded
        assert_eq!(ns.checkpoints().list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_uploads_and_advances() {
        let primary_dir = tempdir().unwrap();
        let receiver = Arc::new(CheckpointReceiver::new(
            CheckpointStore::open(primary_dir.path().join("checkpoint")).unwrap(),
            Arc::new(StateStore::load(primary_dir.path().join("runtime.repository")).unwrap()),
            Duration::from_secs(5),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Arc::clone(&receiver).serve(listener));

        let dir = tempdir().unwrap();
        let ns = open_standby(dir.path());
        let producer = CheckpointProducer::new(
            Arc::clone(&ns),
            CheckpointUploader::new(addr.to_string(), Duration::from_secs(5)),
            Duration::from_secs(60),
        );

        ns.mkdir("/a").unwrap();
        let first = producer.run_once().await.unwrap().unwrap();
        assert_eq!(first.0, 1);

        ns.create_file("/a/f").unwrap();
        let second = producer.run_once().await.unwrap().unwrap();
        assert_eq!(second.0, 2);

        assert_eq!(ns.state().last_checkpoint(), second);
        assert_eq!(ns.checkpoints().list().unwrap(), vec![(second, false)]);
        assert_eq!(producer.run_once().await.unwrap(), None);

        let primary = CheckpointStore::open(primary_dir.path().join("checkpoint")).unwrap();
        let stored = primary.load(second).unwrap().unwrap();
        assert_eq!(stored.tree, ns.tree().to_bytes().unwrap());
        server.abort();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let ns = open_standby(dir.path());
        let uploader = CheckpointUploader::new("127.0.0.1:1", Duration::from_secs(1));
        let producer = CheckpointProducer::new(ns, uploader, Duration::from_millis(20));

        let shutdown = Arc::new(AtomicBool::new(true));
        producer.run(shutdown).await.unwrap();
    }
}
