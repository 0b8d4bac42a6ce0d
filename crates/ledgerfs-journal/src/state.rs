//! Durable runtime state
//!
//! A small flat key/value map that lets a restarted node resume where it
//! stopped: the last checkpoint watermark, the transaction counters and the
//! flushed-segment list. The file is rewritten wholesale on every persist
//! through a temp file and an atomic rename.

use crate::segment::{FlushedSegment, sync_dir};
use ledgerfs_common::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persisted runtime parameters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DurableState {
    /// Highest transaction covered by the last accepted checkpoint
    pub last_checkpoint_max_tx_id: u64,
    /// Timestamp of the last accepted checkpoint
    pub last_checkpoint_timestamp: u64,
    /// Last transaction id handed out
    pub global_tx_id: u64,
    /// Flush watermark of the group commit protocol
    pub synced_log_tx_id: u64,
    /// Highest transaction id written to a segment file
    pub flushed_end_tx_id: u64,
    /// Segments on disk, ascending
    #[serde(rename = "flushedSegmentList")]
    pub flushed_segments: Vec<FlushedSegment>,
}

/// Owner of the durable state file
pub struct StateStore {
    path: PathBuf,
    state: Mutex<DurableState>,
    /// Serializes writers so an older snapshot never overwrites a newer one
    persist_lock: Mutex<()>,
}

impl StateStore {
    /// Load state from `path`, starting empty if the file does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) if data.is_empty() => DurableState::default(),
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                Error::Deserialization(format!("state file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {:?}, starting fresh", path);
                DurableState::default()
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to read state file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        info!(
            "Loaded durable state: checkpoint tx {}, global tx {}, {} segments",
            state.last_checkpoint_max_tx_id,
            state.global_tx_id,
            state.flushed_segments.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
            persist_lock: Mutex::new(()),
        })
    }

    /// Copy of the current state
    pub fn get(&self) -> DurableState {
        self.state.lock().clone()
    }

    /// `(max_tx_id, timestamp)` of the last accepted checkpoint
    pub fn last_checkpoint(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.last_checkpoint_max_tx_id, state.last_checkpoint_timestamp)
    }

    /// Mutate the in-memory state; call [`Self::persist`] to make it durable
    pub fn update<R>(&self, f: impl FnOnce(&mut DurableState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Rewrite the state file with the current state
    pub fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let data = serde_json::to_vec_pretty(&*self.state.lock())
            .map_err(|e| Error::Serialization(format!("durable state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| Error::Storage(format!("failed to create state file: {e}")))?;
            file.write_all(&data)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::Storage(format!("failed to rename state file: {e}")))?;
        if let Some(parent) = self.path.parent() {
            sync_dir(parent)?;
        }

        debug!("Persisted durable state to {:?}", self.path);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempdir().unwrap();
        let store = StateStore::load(dir.path().join("runtime.repository")).unwrap();
        assert_eq!(store.get(), DurableState::default());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime.repository");

        let store = StateStore::load(&path).unwrap();
        store.update(|s| {
            s.last_checkpoint_max_tx_id = 40;
            s.last_checkpoint_timestamp = 1_700_000_000_000;
            s.global_tx_id = 55;
            s.synced_log_tx_id = 50;
            s.flushed_end_tx_id = 50;
            s.flushed_segments = vec![FlushedSegment::new(1, 20), FlushedSegment::new(21, 50)];
        });
        store.persist().unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.get(), store.get());
        assert_eq!(reloaded.last_checkpoint(), (40, 1_700_000_000_000));
    }

    #[test]
    fn test_file_is_flat_camel_case_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).unwrap();
        store.update(|s| s.global_tx_id = 7);
        store.persist().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map["globalTxId"], 7);
        assert!(map.contains_key("lastCheckpointMaxTxId"));
        assert!(map.contains_key("syncedLogTxId"));
        assert!(map["flushedSegmentList"].is_array());
    }

    #[test]
    fn test_unknown_and_missing_keys_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"globalTxId": 3, "somethingElse": true}"#).unwrap();
        let store = StateStore::load(&path).unwrap();
        assert_eq!(store.get().global_tx_id, 3);
        assert_eq!(store.get().last_checkpoint_max_tx_id, 0);
    }
}
