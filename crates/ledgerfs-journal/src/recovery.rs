//! Recovery and replay dispatch
//!
//! Startup loads the newest checkpoint into the namespace tree and replays
//! every segment holding newer transactions, oldest first. Standby
//! replication applies pulled records through the same [`apply`] dispatch
//! and the same [`ReplaySequence`] ordering rules.

use crate::checkpoint::store::{CheckpointId, CheckpointStore};
use crate::namespace::{CreateOutcome, NamespaceTree};
use crate::op::{LogRecord, Operation};
use crate::segment;
use crate::state::DurableState;
use ledgerfs_common::{Error, ReplayMode, Result};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Apply one record to the tree
pub fn apply(tree: &NamespaceTree, record: &LogRecord) {
    match &record.operation {
        Operation::MakeDirectory { path } => {
            if !tree.make_directory(record.tx_id, path) {
                debug!("tx {}: mkdir {} blocked by a file", record.tx_id, path);
            }
        }
        Operation::CreateFile { file_name } => {
            let outcome = tree.create_file(record.tx_id, file_name);
            if outcome != CreateOutcome::Created {
                debug!("tx {}: create {} -> {:?}", record.tx_id, file_name, outcome);
            }
        }
    }
}

/// Tracks the next expected transaction id while replaying
#[derive(Debug, Clone)]
pub struct ReplaySequence {
    next_expected: u64,
    mode: ReplayMode,
    gaps: u64,
}

impl ReplaySequence {
    /// Start after `last_applied`
    #[must_use]
    pub const fn new(last_applied: u64, mode: ReplayMode) -> Self {
        Self {
            next_expected: last_applied + 1,
            mode,
            gaps: 0,
        }
    }

    /// Decide whether `tx_id` should be applied.
    ///
    /// Ids below the expected one were already applied and are skipped.
    /// An id past the expected one is a gap: lenient mode warns and
    /// applies, strict mode fails.
    pub fn admit(&mut self, tx_id: u64) -> Result<bool> {
        if tx_id < self.next_expected {
            return Ok(false);
        }
        if tx_id > self.next_expected {
            match self.mode {
                ReplayMode::Lenient => {
                    warn!(
                        "Transaction id gap: expected {}, found {}",
                        self.next_expected, tx_id
                    );
                    self.gaps += 1;
                }
                ReplayMode::Strict => {
                    return Err(Error::SequenceGap {
                        expected: self.next_expected,
                        found: tx_id,
                    });
                }
            }
        }
        self.next_expected = tx_id + 1;
        Ok(true)
    }

    /// Last id admitted (or the starting point)
    #[must_use]
    pub const fn last_applied(&self) -> u64 {
        self.next_expected - 1
    }

    #[must_use]
    pub const fn gaps(&self) -> u64 {
        self.gaps
    }
}

/// What recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Checkpoint loaded, if any
    pub checkpoint: Option<CheckpointId>,
    /// Segment files read
    pub segments: usize,
    /// Records applied to the tree
    pub applied: u64,
    /// Records skipped as already covered
    pub skipped: u64,
    /// Gaps tolerated in lenient mode
    pub gaps: u64,
    /// Tree watermark after recovery
    pub max_tx_id: u64,
}

/// Rebuild `tree` from the newest checkpoint and the segments after it
pub fn recover(
    tree: &NamespaceTree,
    checkpoints: &CheckpointStore,
    edits_dir: &Path,
    state: &DurableState,
    mode: ReplayMode,
) -> Result<RecoveryReport> {
    let start = Instant::now();
    let mut report = RecoveryReport::default();

    let hint = (state.last_checkpoint_max_tx_id, state.last_checkpoint_timestamp);
    let image_tx_id = match checkpoints.load_latest(hint)? {
        Some(snapshot) => {
            tree.restore(&snapshot)?;
            report.checkpoint = Some((snapshot.max_tx_id, snapshot.timestamp));
            info!(
                "Restored namespace from checkpoint at tx {}",
                snapshot.max_tx_id
            );
            snapshot.max_tx_id
        }
        None => {
            debug!("No checkpoint to load");
            0
        }
    };

    let segments: Vec<_> = segment::list_segments(edits_dir)?
        .into_iter()
        .filter(|(seg, _)| seg.max_tx_id > image_tx_id)
        .collect();

    info!(
        "Replaying {} segments after tx {}",
        segments.len(),
        image_tx_id
    );

    let mut sequence = ReplaySequence::new(image_tx_id, mode);
    for (i, (seg, path)) in segments.iter().enumerate() {
        // Only the newest segment can have been cut short by a crash
        let records = if i + 1 == segments.len() {
            segment::read_tail_segment(edits_dir, seg, path)?
        } else {
            segment::read_segment(path)?
        };
        let mut applied = 0u64;
        for record in records {
            if sequence.admit(record.tx_id)? {
                apply(tree, &record);
                applied += 1;
            } else {
                report.skipped += 1;
            }
        }
        debug!("Replayed {} records from segment {}", applied, seg);
        report.applied += applied;
    }

    report.segments = segments.len();
    report.gaps = sequence.gaps();
    report.max_tx_id = tree.max_tx_id();

    info!(
        "Recovery finished in {:?}: {} records applied, {} skipped, {} gaps, tx {}",
        start.elapsed(),
        report.applied,
        report.skipped,
        report.gaps,
        report.max_tx_id
    );
    Ok(report)
}
