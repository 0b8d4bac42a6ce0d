//! Per-process bundle of the namespace tree, transaction log and state store

use crate::checkpoint::store::CheckpointStore;
use crate::editlog::TransactionLog;
use crate::namespace::{CreateOutcome, NamespaceTree, Snapshot};
use crate::op::{LogRecord, Operation};
use crate::recovery::{self, RecoveryReport};
use crate::state::StateStore;
use ledgerfs_common::{Config, Error, Result};
use std::sync::Arc;
use tracing::{error, info};

/// Namespace metadata service of one node.
///
/// Live operations are logged before they touch the tree, so after a crash
/// the log alone decides what happened.
pub struct NameSystem {
    config: Config,
    tree: Arc<NamespaceTree>,
    log: Arc<TransactionLog>,
    state: Arc<StateStore>,
    checkpoints: CheckpointStore,
    recovery: RecoveryReport,
}

impl NameSystem {
    /// Load durable state, recover the tree and open the log
    pub fn open(config: &Config) -> Result<Self> {
        let storage = &config.storage;
        info!("Opening name system in {:?}", storage.data_dir);

        let state = Arc::new(StateStore::load(storage.state_file())?);
        let checkpoints = CheckpointStore::open(storage.checkpoint_dir())?;
        let tree = Arc::new(NamespaceTree::new());

        let report = recovery::recover(
            &tree,
            &checkpoints,
            &storage.edits_dir(),
            &state.get(),
            config.journal.replay_mode,
        )?;

        let log = Arc::new(TransactionLog::open(
            storage.edits_dir(),
            config.journal.clone(),
            Arc::clone(&state),
            tree.max_tx_id(),
        )?);
        if config.journal.background_cleaner {
            log.start_cleaner();
        }

        Ok(Self {
            config: config.clone(),
            tree,
            log,
            state,
            checkpoints,
            recovery: report,
        })
    }

    /// Create `path` and any missing parents
    pub fn mkdir(&self, path: &str) -> Result<bool> {
        let tx_id = self.log_operation(Operation::MakeDirectory {
            path: path.to_string(),
        })?;
        Ok(self.tree.make_directory(tx_id, path))
    }

    /// Create a file under an existing directory
    pub fn create_file(&self, file_name: &str) -> Result<CreateOutcome> {
        let tx_id = self.log_operation(Operation::CreateFile {
            file_name: file_name.to_string(),
        })?;
        Ok(self.tree.create_file(tx_id, file_name))
    }

    fn log_operation(&self, operation: Operation) -> Result<u64> {
        self.log.append(operation)?.ok_or(Error::ShuttingDown)
    }

    /// Apply a record produced elsewhere.
    ///
    /// With `relog` the record is first appended to the local log under its
    /// own id, as the standby does for records pulled from the primary.
    pub fn replay(&self, record: &LogRecord, relog: bool) -> Result<()> {
        if relog {
            self.log
                .append_replayed(record)?
                .ok_or(Error::ShuttingDown)?;
        }
        recovery::apply(&self.tree, record);
        Ok(())
    }

    /// Snapshot of the tree if it moved past the last checkpoint
    pub fn snapshot(&self) -> Result<Option<Snapshot>> {
        let (checkpoint_tx_id, _) = self.state.last_checkpoint();
        self.tree.snapshot(checkpoint_tx_id)
    }

    /// Id of the last transaction applied to the tree
    pub fn synced_tx_id(&self) -> u64 {
        self.tree.max_tx_id()
    }

    /// Flush buffered records and persist the durable state
    pub fn persist(&self) -> Result<()> {
        self.log.force_flush()
    }

    /// Stop background work and flush. Later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        self.log.shutdown()
    }

    pub const fn tree(&self) -> &Arc<NamespaceTree> {
        &self.tree
    }

    pub const fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    pub const fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub const fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// What startup recovery did
    pub const fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }
}

impl Drop for NameSystem {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Name system shutdown failed: {}", e);
        }
    }
}
