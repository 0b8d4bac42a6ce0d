//! LedgerFS Journal - Metadata durability engine
//!
//! This crate implements the metadata engine of a LedgerFS name node:
//! - Operation log with a double buffer and group commit
//! - In-memory namespace tree with snapshots
//! - Recovery from the latest checkpoint plus log replay
//! - Checkpoint upload from the standby to the primary
//! - Log fetching and standby replication
//! - Durable runtime state

pub mod buffer;
pub mod checkpoint;
pub mod editlog;
pub mod fetch;
pub mod namespace;
pub mod namesystem;
pub mod op;
pub mod recovery;
pub mod replicator;
pub mod segment;
pub mod state;

mod net;

// Re-exports
pub use buffer::{DoubleBuffer, LogBuffer};
pub use checkpoint::{
    CheckpointId, CheckpointProducer, CheckpointReceiver, CheckpointStore, CheckpointUploader,
};
pub use editlog::{LogStats, TransactionLog};
pub use fetch::{FetchService, LogFetcher, RemoteLogSource};
pub use namespace::{CreateOutcome, Directory, NamespaceTree, Node, Snapshot};
pub use namesystem::NameSystem;
pub use op::{LogRecord, Operation};
pub use recovery::{RecoveryReport, ReplaySequence};
pub use replicator::{LogReplicator, LogSource};
pub use segment::FlushedSegment;
pub use state::{DurableState, StateStore};
