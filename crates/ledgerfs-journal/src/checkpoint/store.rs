//! Checkpoint files on disk
//!
//! The current checkpoint is `fsimage-<maxTxId>.<timestamp>`. Before a new
//! one is written the old file is renamed to `<name>.last`, and the backup is
//! deleted only after the new file is durable. A crash therefore leaves
//! either a complete old image or a complete new one.

use crate::namespace::Snapshot;
use crate::segment::sync_dir;
use ledgerfs_common::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const IMAGE_PREFIX: &str = "fsimage-";
const BACKUP_SUFFIX: &str = ".last";

/// Identity of a checkpoint file: `(max_tx_id, timestamp)`
pub type CheckpointId = (u64, u64);

/// Directory holding the current checkpoint and its transient backup
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open the store, creating `dir` if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("failed to create checkpoint dir: {e}")))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the current checkpoint file for `id`
    #[must_use]
    pub fn current_path(&self, (max_tx_id, timestamp): CheckpointId) -> PathBuf {
        self.dir
            .join(format!("{IMAGE_PREFIX}{max_tx_id}.{timestamp}"))
    }

    /// Path of the backup file for `id`
    #[must_use]
    pub fn backup_path(&self, id: CheckpointId) -> PathBuf {
        let mut name = self.current_path(id).into_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    /// Rename the current checkpoint `previous` to its backup name.
    /// Returns the backup path, or `None` if there was nothing to rotate.
    pub fn rotate(&self, previous: CheckpointId) -> Result<Option<PathBuf>> {
        let current = self.current_path(previous);
        if !current.exists() {
            debug!("No checkpoint file {:?} to rotate", current);
            return Ok(None);
        }

        let backup = self.backup_path(previous);
        fs::rename(&current, &backup).map_err(|e| {
            Error::Storage(format!("failed to rotate checkpoint {}: {}", current.display(), e))
        })?;
        sync_dir(&self.dir)?;
        debug!("Rotated checkpoint {:?} to {:?}", current, backup);
        Ok(Some(backup))
    }

    /// Write `snapshot` as the current checkpoint and force it to disk
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let path = self.current_path((snapshot.max_tx_id, snapshot.timestamp));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| {
                    Error::Storage(format!("failed to create checkpoint {}: {}", path.display(), e))
                })?;
            file.write_all(&snapshot.tree)?;
            file.sync_all()?;
        }
        sync_dir(&self.dir)?;
        debug!(
            "Wrote checkpoint {:?} ({} bytes)",
            path,
            snapshot.tree.len()
        );
        Ok(path)
    }

    /// Delete the backup of `previous` if it exists
    pub fn discard_backup(&self, previous: CheckpointId) -> Result<()> {
        let backup = self.backup_path(previous);
        match fs::remove_file(&backup) {
            Ok(()) => {
                debug!("Deleted checkpoint backup {:?}", backup);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "failed to delete checkpoint backup {}: {}",
                backup.display(),
                e
            ))),
        }
    }

    /// Rotate, write and clean up in one step.
    ///
    /// A snapshot with the same id as `previous` still goes through the
    /// rotation, so the current file is never rewritten in place.
    pub fn install(&self, previous: CheckpointId, snapshot: &Snapshot) -> Result<PathBuf> {
        self.rotate(previous)?;
        let path = self.write(snapshot)?;
        self.discard_backup(previous)?;
        Ok(path)
    }

    /// Read the checkpoint `id`, falling back to its backup
    pub fn load(&self, id: CheckpointId) -> Result<Option<Snapshot>> {
        for path in [self.current_path(id), self.backup_path(id)] {
            match fs::read(&path) {
                Ok(tree) => {
                    info!("Loaded checkpoint {:?}", path);
                    return Ok(Some(Snapshot::new(id.0, id.1, tree)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "failed to read checkpoint {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Load the checkpoint named by `hint`, or else the newest one on disk
    pub fn load_latest(&self, hint: CheckpointId) -> Result<Option<Snapshot>> {
        if hint != (0, 0) {
            if let Some(snapshot) = self.load(hint)? {
                return Ok(Some(snapshot));
            }
            warn!(
                "Checkpoint ({}, {}) recorded in state is missing, scanning {:?}",
                hint.0, hint.1, self.dir
            );
        }

        let newest = self.list()?.into_iter().map(|(id, _)| id).max();
        match newest {
            Some(id) => self.load(id),
            None => Ok(None),
        }
    }

    /// Delete every checkpoint file except the current image `keep`.
    ///
    /// Clears leftovers of interrupted uploads and stale backups. Failures
    /// are logged and skipped. Returns the number of files removed.
    pub fn prune(&self, keep: CheckpointId) -> Result<usize> {
        let mut removed = 0;
        for (id, backup) in self.list()? {
            if id == keep && !backup {
                continue;
            }
            let path = if backup {
                self.backup_path(id)
            } else {
                self.current_path(id)
            };
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Pruned stale checkpoint {:?}", path);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to prune checkpoint {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    /// Every checkpoint file in the directory with its identity and
    /// whether it is a backup
    pub fn list(&self) -> Result<Vec<(CheckpointId, bool)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(parsed) = entry.file_name().to_str().and_then(parse_file_name) {
                found.push(parsed);
            }
        }
        found.sort_unstable();
        Ok(found)
    }
}

/// Parse `fsimage-<max>.<ts>[.last]`
fn parse_file_name(name: &str) -> Option<(CheckpointId, bool)> {
    let rest = name.strip_prefix(IMAGE_PREFIX)?;
    let (rest, backup) = match rest.strip_suffix(BACKUP_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (rest, false),
    };
    let (max, ts) = rest.split_once('.')?;
    Some(((max.parse().ok()?, ts.parse().ok()?), backup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        assert!(store.current_path((3, 99)).ends_with("fsimage-3.99"));
        assert!(store.backup_path((3, 99)).ends_with("fsimage-3.99.last"));
        assert_eq!(parse_file_name("fsimage-3.99"), Some(((3, 99), false)));
        assert_eq!(parse_file_name("fsimage-3.99.last"), Some(((3, 99), true)));
        assert_eq!(parse_file_name("fsimage-x.99"), None);
        assert_eq!(parse_file_name("edits-1-2.log"), None);
    }

    #[test]
    fn test_install_replaces_previous() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        let first = Snapshot::new(5, 100, b"{\"v\":1}".to_vec());
        store.install((0, 0), &first).unwrap();
        let second = Snapshot::new(9, 200, b"{\"v\":2}".to_vec());
        let path = store.install((5, 100), &second).unwrap();

        assert_eq!(fs::read(path).unwrap(), second.tree);
        assert_eq!(store.list().unwrap(), vec![((9, 200), false)]);
    }

    #[test]
    fn test_reinstall_same_id_goes_through_backup() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.install((0, 0), &Snapshot::new(5, 100, b"first".to_vec())).unwrap();

        // Interrupted re-upload: the complete image survives as the backup
        store.rotate((5, 100)).unwrap();
        assert_eq!(fs::read(store.backup_path((5, 100))).unwrap(), b"first");
        assert_eq!(store.load_latest((5, 100)).unwrap().unwrap().tree, b"first");

        let again = Snapshot::new(5, 100, b"second".to_vec());
        let path = store.install((5, 100), &again).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"second");
        assert!(!store.backup_path((5, 100)).exists());
        assert_eq!(store.list().unwrap(), vec![((5, 100), false)]);
    }

    #[test]
    fn test_load_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.write(&Snapshot::new(4, 10, b"old".to_vec())).unwrap();

        // Crash after rotate, before the new image was written
        store.rotate((4, 10)).unwrap();
        assert!(!store.current_path((4, 10)).exists());

        let loaded = store.load_latest((4, 10)).unwrap().unwrap();
        assert_eq!(loaded.max_tx_id, 4);
        assert_eq!(loaded.tree, b"old");
    }

    #[test]
    fn test_prune_keeps_only_current() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.write(&Snapshot::new(3, 10, b"orphan".to_vec())).unwrap();
        store.write(&Snapshot::new(5, 20, b"old".to_vec())).unwrap();
        store.rotate((5, 20)).unwrap();
        store.write(&Snapshot::new(8, 30, b"new".to_vec())).unwrap();

        assert_eq!(store.prune((8, 30)).unwrap(), 2);
        assert_eq!(store.list().unwrap(), vec![((8, 30), false)]);
        assert_eq!(store.prune((8, 30)).unwrap(), 0);
    }

    #[test]
    fn test_load_latest_scans_when_state_is_stale() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.write(&Snapshot::new(2, 10, b"a".to_vec())).unwrap();
        store.write(&Snapshot::new(7, 20, b"b".to_vec())).unwrap();

        let loaded = store.load_latest((0, 0)).unwrap().unwrap();
        assert_eq!((loaded.max_tx_id, loaded.timestamp), (7, 20));
        assert!(store.load_latest((99, 1)).unwrap().is_some());

        let empty = tempdir().unwrap();
        let store = CheckpointStore::open(empty.path()).unwrap();
        assert!(store.load_latest((0, 0)).unwrap().is_none());
    }
}
