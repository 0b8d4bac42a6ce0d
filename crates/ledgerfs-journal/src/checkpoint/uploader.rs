//! Standby-side checkpoint upload client

use super::wire::{self, ACK};
use crate::namespace::Snapshot;
use crate::net::io_timeout;
use ledgerfs_common::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Sends checkpoints to the primary, one short-lived connection each
#[derive(Clone, Debug)]
pub struct CheckpointUploader {
    addr: String,
    io_timeout: Duration,
}

impl CheckpointUploader {
    pub fn new(addr: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            io_timeout,
        }
    }

    /// Upload `snapshot` and wait for the acknowledgement
    pub async fn upload(&self, snapshot: &Snapshot) -> Result<()> {
        let message = wire::encode(snapshot)?;

        let mut stream = io_timeout(self.io_timeout, TcpStream::connect(&self.addr)).await?;
        debug!(
            "Uploading checkpoint at tx {} ({} bytes) to {}",
            snapshot.max_tx_id,
            snapshot.tree.len(),
            self.addr
        );
        io_timeout(self.io_timeout, stream.write_all(&message)).await?;
        io_timeout(self.io_timeout, stream.flush()).await?;

        let mut ack = vec![0u8; ACK.len()];
        io_timeout(self.io_timeout, stream.read_exact(&mut ack)).await?;
        if ack != ACK {
            return Err(Error::protocol(format!(
                "unexpected checkpoint acknowledgement {:?}",
                String::from_utf8_lossy(&ack)
            )));
        }

        info!(
            "Checkpoint at tx {} acknowledged by {}",
            snapshot.max_tx_id, self.addr
        );
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
