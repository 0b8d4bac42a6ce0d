//! Configuration types for LedgerFS
//!
//! Every section deserializes with defaults for missing fields, so an empty
//! TOML file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a LedgerFS node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// On-disk layout
    pub storage: StorageConfig,
    /// Transaction log tuning
    pub journal: JournalConfig,
    /// Checkpoint exchange between standby and primary
    pub checkpoint: CheckpointConfig,
    /// Standby log pulling
    pub replication: ReplicationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Create config with every path rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.as_ref().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Storage layout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for everything the node persists
    pub data_dir: PathBuf,
    /// Log segment directory (default: `<data_dir>/edits`)
    pub edits_dir: Option<PathBuf>,
    /// Checkpoint directory (default: `<data_dir>/checkpoint`)
    pub checkpoint_dir: Option<PathBuf>,
    /// Durable state file (default: `<data_dir>/runtime.repository`)
    pub state_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./ledgerfs-data"),
            edits_dir: None,
            checkpoint_dir: None,
            state_file: None,
        }
    }
}

impl StorageConfig {
    /// Resolved log segment directory
    #[must_use]
    pub fn edits_dir(&self) -> PathBuf {
        self.edits_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("edits"))
    }

    /// Resolved checkpoint directory
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("checkpoint"))
    }

    /// Resolved durable state file
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("runtime.repository"))
    }
}

/// How replay treats a transaction id that skips ahead of the expected one
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Warn and apply the record anyway
    #[default]
    Lenient,
    /// Refuse the record and stop replay
    Strict,
}

/// Transaction log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Active buffer size that triggers a group flush (default: 25 KB)
    pub buffer_limit_bytes: usize,
    /// Upper bound on a single condition variable wait before re-checking
    pub wait_interval_ms: u64,
    /// Gap handling during recovery and standby replay
    pub replay_mode: ReplayMode,
    /// Run the segment cleaner in the background
    pub background_cleaner: bool,
    /// Cleaner pass interval
    pub cleaner_interval_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            buffer_limit_bytes: 25 * 1024, // 25 KB
            wait_interval_ms: 1000,
            replay_mode: ReplayMode::Lenient,
            background_cleaner: true,
            cleaner_interval_ms: 1000,
        }
    }
}

impl JournalConfig {
    /// Bounded wait used by the group commit protocol
    #[must_use]
    pub const fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    /// Pause between cleaner passes
    #[must_use]
    pub const fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms)
    }
}

/// Checkpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Seconds between checkpoint attempts on the standby
    pub interval_secs: u64,
    /// Address the primary accepts uploads on
    pub listen_addr: String,
    /// Primary address the standby uploads to
    pub primary_addr: String,
    /// Connect/read/write timeout for one upload
    pub io_timeout_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            listen_addr: "0.0.0.0:3031".to_string(),
            primary_addr: "127.0.0.1:3031".to_string(),
            io_timeout_secs: 30,
        }
    }
}

impl CheckpointConfig {
    /// Checkpoint timer period
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-upload network timeout
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Standby replication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Maximum records returned by one fetch
    pub max_fetch_size: usize,
    /// Sleep after an empty or short batch
    pub backoff_ms: u64,
    /// Address the primary serves fetches on
    pub listen_addr: String,
    /// Primary address the standby fetches from
    pub primary_addr: String,
    /// Connect/read timeout for one fetch
    pub io_timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_fetch_size: 10,
            backoff_ms: 1000,
            listen_addr: "0.0.0.0:3030".to_string(),
            primary_addr: "127.0.0.1:3030".to_string(),
            io_timeout_secs: 10,
        }
    }
}

impl ReplicationConfig {
    /// Backoff after a short batch
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Per-fetch network timeout
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
