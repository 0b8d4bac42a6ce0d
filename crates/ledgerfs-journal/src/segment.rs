//! Flushed log segments
//!
//! Each flush writes one file named after the transaction range it holds:
//! `edits-<min>-<max>.log`. Ranges of consecutive segments are contiguous.
//!
//! Segments are written to a `.tmp` sibling and renamed into place, so a
//! listed segment name never points at a half-written file. The newest
//! segment is still read with [`read_tail_segment`], which cuts off a torn
//! or corrupted tail instead of failing.

use crate::op::LogRecord;
use ledgerfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const SEGMENT_PREFIX: &str = "edits-";
const SEGMENT_SUFFIX: &str = ".log";

/// A durable, contiguous range of transaction ids
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushedSegment {
    pub min_tx_id: u64,
    pub max_tx_id: u64,
}

impl FlushedSegment {
    pub const fn new(min_tx_id: u64, max_tx_id: u64) -> Self {
        Self {
            min_tx_id,
            max_tx_id,
        }
    }

    /// Whether `tx_id` falls inside this segment
    #[must_use]
    pub const fn contains(&self, tx_id: u64) -> bool {
        tx_id >= self.min_tx_id && tx_id <= self.max_tx_id
    }

    /// File name for this range
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{SEGMENT_PREFIX}{}-{}{SEGMENT_SUFFIX}",
            self.min_tx_id, self.max_tx_id
        )
    }

    /// Full path of this segment under `dir`
    #[must_use]
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Parse a segment file name; anything else yields `None`
    #[must_use]
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let range = name
            .strip_prefix(SEGMENT_PREFIX)?
            .strip_suffix(SEGMENT_SUFFIX)?;
        let (min, max) = range.split_once('-')?;
        let min_tx_id = min.parse().ok()?;
        let max_tx_id = max.parse().ok()?;
        (min_tx_id <= max_tx_id).then_some(Self::new(min_tx_id, max_tx_id))
    }
}

impl fmt::Display for FlushedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min_tx_id, self.max_tx_id)
    }
}

/// Check `segment[i+1].min == segment[i].max + 1` over an ordered list
#[must_use]
pub fn is_contiguous(segments: &[FlushedSegment]) -> bool {
    segments
        .windows(2)
        .all(|w| w[1].min_tx_id == w[0].max_tx_id + 1)
}

/// Write `data` as the segment file for `segment` and force it to disk
pub fn write_segment(dir: &Path, segment: &FlushedSegment, data: &[u8]) -> Result<PathBuf> {
    let path = segment.path_in(dir);
    let tmp_path = path.with_extension("log.tmp");

    let write = || -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_data()?;
        fs::rename(&tmp_path, &path)?;
        sync_dir(dir)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(path)
}

/// Read every record of a segment file in file order
pub fn read_segment(path: &Path) -> Result<Vec<LogRecord>> {
    let data = fs::read(path)
        .map_err(|e| Error::Storage(format!("failed to read segment {}: {}", path.display(), e)))?;
    LogRecord::decode_lines(&data)
}

/// Read the newest segment, cutting off a damaged tail.
///
/// Records up to the first bad one are kept. The file is rewritten under
/// the range those records cover, or removed when none survive.
pub fn read_tail_segment(
    dir: &Path,
    segment: &FlushedSegment,
    path: &Path,
) -> Result<Vec<LogRecord>> {
    let data = fs::read(path)
        .map_err(|e| Error::Storage(format!("failed to read segment {}: {}", path.display(), e)))?;
    let decoded = LogRecord::decode_prefix(&data);
    let Some(reason) = decoded.error else {
        return Ok(decoded.records);
    };

    warn!(
        "Segment {} damaged at byte {} of {} ({}), keeping {} records",
        segment,
        decoded.valid_len,
        data.len(),
        reason,
        decoded.records.len()
    );

    match decoded.records.last() {
        Some(last) => {
            let kept = FlushedSegment::new(segment.min_tx_id, last.tx_id.max(segment.min_tx_id));
            write_segment(dir, &kept, &data[..decoded.valid_len])?;
            if kept != *segment {
                fs::remove_file(path)?;
                sync_dir(dir)?;
            }
            warn!("Segment {} cut back to {}", segment, kept);
        }
        None => {
            fs::remove_file(path)?;
            sync_dir(dir)?;
            warn!("Segment {} held no intact records, removed", segment);
        }
    }
    Ok(decoded.records)
}

/// List segment files in `dir`, ascending by range
pub fn list_segments(dir: &Path) -> Result<Vec<(FlushedSegment, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Storage(format!(
                "failed to list segments in {}: {}",
                dir.display(),
                e
            )));
        }
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(segment) = name.to_str().and_then(FlushedSegment::parse_file_name) {
            segments.push((segment, entry.path()));
        }
    }
    segments.sort_by_key(|(s, _)| (s.max_tx_id, s.min_tx_id));
    Ok(segments)
}

/// Sync a directory so renames and new files inside it survive a crash
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
