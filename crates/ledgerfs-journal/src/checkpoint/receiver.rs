//! Primary-side checkpoint endpoint
//!
//! Accepts one upload per connection, installs it with the same
//! rotate/write/discard sequence the producer uses and records the new
//! checkpoint watermark before acknowledging.

use super::store::{CheckpointId, CheckpointStore};
use super::wire::{ACK, CheckpointDecoder};
use crate::namespace::Snapshot;
use crate::net::{blocking, io_timeout};
use crate::state::StateStore;
use ledgerfs_common::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 64 * 1024;

/// Accepts uploaded checkpoints from the standby
pub struct CheckpointReceiver {
    store: CheckpointStore,
    state: Arc<StateStore>,
    io_timeout: Duration,
    /// Uploads are installed one at a time
    install_lock: Mutex<()>,
}

impl CheckpointReceiver {
    pub fn new(store: CheckpointStore, state: Arc<StateStore>, io_timeout: Duration) -> Self {
        Self {
            store,
            state,
            io_timeout,
            install_lock: Mutex::new(()),
        }
    }

    /// Accept loop. Runs until the task is aborted.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Checkpoint receiver listening on {addr}"),
            Err(e) => warn!("Checkpoint receiver: no local address: {e}"),
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let receiver = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = receiver.handle_upload(stream, peer).await {
                            warn!("Checkpoint upload from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Checkpoint receiver: accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_upload(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!("Checkpoint upload from {peer}");

        let mut decoder = CheckpointDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let snapshot = loop {
            let n = io_timeout(self.io_timeout, stream.read(&mut chunk)).await?;
            if n == 0 {
                return Err(Error::protocol(format!(
                    "connection closed before checkpoint was complete (partial: {})",
                    decoder.in_progress()
                )));
            }
            decoder.feed(&chunk[..n]);
            if let Some(snapshot) = decoder.decode()? {
                break snapshot;
            }
        };

        info!(
            "Received checkpoint at tx {} ({} bytes) from {peer}",
            snapshot.max_tx_id,
            snapshot.tree.len()
        );

        let receiver = Arc::clone(&self);
        blocking(move || receiver.install(&snapshot)).await?;

        io_timeout(self.io_timeout, stream.write_all(ACK)).await?;
        io_timeout(self.io_timeout, stream.shutdown()).await?;
        debug!("Acknowledged checkpoint upload from {peer}");
        Ok(())
    }

    /// Make `snapshot` the current checkpoint and record its watermark.
    ///
    /// An upload older than the current checkpoint is acknowledged but not
    /// installed.
    pub fn install(&self, snapshot: &Snapshot) -> Result<CheckpointId> {
        let _guard = self.install_lock.lock();
        let previous = self.state.last_checkpoint();
        if snapshot.max_tx_id < previous.0 {
            warn!(
                "Ignoring stale checkpoint at tx {} (current tx {})",
                snapshot.max_tx_id, previous.0
            );
            return Ok(previous);
        }

        let path = self.store.install(previous, snapshot)?;
        let id = (snapshot.max_tx_id, snapshot.timestamp);
        self.state.update(|s| {
            s.last_checkpoint_max_tx_id = id.0;
            s.last_checkpoint_timestamp = id.1;
        });
        self.state.persist()?;

        let pruned = self.store.prune(id)?;
        if pruned > 0 {
            debug!("Pruned {} stale checkpoint files", pruned);
        }
        info!("Installed checkpoint {:?}", path);
        Ok(id)
    }
}
