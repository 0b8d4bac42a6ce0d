//! Transaction log coordinator
//!
//! Assigns transaction ids, buffers records in a [`DoubleBuffer`] and runs
//! the group commit flush. One mutex and one condition variable guard the
//! buffer pair, the `scheduling`/`sync_running` flags, the watermarks and the
//! flushed-segment list. Segment files are written with the mutex released,
//! so appenders keep filling the fresh buffer while a flush is in flight.
//!
//! ```text
//!  append ──► active buffer ──(limit reached)──► swap ──► sync buffer ──► edits-<min>-<max>.log
//!                 ▲                                              │
//!                 └────────────── recycled after flush ◄─────────┘
//! ```
//!
//! At most one flush runs at a time. A writer whose id is already covered by
//! the flush watermark does not wait for the disk at all.

use crate::buffer::{DoubleBuffer, LogBuffer};
use crate::op::{LogRecord, Operation};
use crate::segment::{self, FlushedSegment};
use crate::state::StateStore;
use ledgerfs_common::{Error, JournalConfig, Result};
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

struct LogInner {
    /// Last id handed out
    tx_id: u64,
    /// Flush watermark: every id up to here is in a swapped-out buffer
    synced_tx_id: u64,
    /// Highest id actually written to a segment file
    flushed_tx_id: u64,
    /// A writer filled the active buffer and a swap is pending
    scheduling: bool,
    /// A segment file is being written
    sync_running: bool,
    /// Set once a flush failed; the log refuses further work
    failed: Option<String>,
    buffers: DoubleBuffer,
    segments: Vec<FlushedSegment>,
    flush_count: u64,
    bytes_flushed: u64,
}

/// Point-in-time counters of a [`TransactionLog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    pub tx_id: u64,
    pub synced_tx_id: u64,
    pub flushed_tx_id: u64,
    pub segment_count: usize,
    pub flush_count: u64,
    pub bytes_flushed: u64,
    pub buffered_bytes: usize,
    pub sync_running: bool,
}

/// Write-ahead log of namespace operations
pub struct TransactionLog {
    edits_dir: PathBuf,
    config: JournalConfig,
    state: Arc<StateStore>,
    inner: Mutex<LogInner>,
    cond: Condvar,
    /// Appends become no-ops once set
    closing: AtomicBool,
    cleaner_shutdown: Arc<AtomicBool>,
    cleaner_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TransactionLog {
    /// Open the log in `edits_dir`.
    ///
    /// Counters resume from the durable state, the segment files on disk and
    /// `recovered_tx_id` (the namespace watermark after recovery), whichever
    /// is highest.
    pub fn open(
        edits_dir: impl AsRef<Path>,
        config: JournalConfig,
        state: Arc<StateStore>,
        recovered_tx_id: u64,
    ) -> Result<Self> {
        let edits_dir = edits_dir.as_ref().to_path_buf();
        fs::create_dir_all(&edits_dir)
            .map_err(|e| Error::Storage(format!("failed to create edits dir: {e}")))?;

        let persisted = state.get();
        let segments: Vec<FlushedSegment> = segment::list_segments(&edits_dir)?
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        if !segment::is_contiguous(&segments) {
            warn!("Segment files in {:?} are not contiguous", edits_dir);
        }
        if segments.len() != persisted.flushed_segments.len() {
            debug!(
                "Segment list rebuilt from disk: {} files, {} recorded",
                segments.len(),
                persisted.flushed_segments.len()
            );
        }

        let on_disk = segments.last().map_or(0, |s| s.max_tx_id);
        let flushed_tx_id = persisted
            .flushed_end_tx_id
            .max(on_disk)
            .max(recovered_tx_id);
        let tx_id = persisted.global_tx_id.max(flushed_tx_id);

        info!(
            "Opened transaction log at {:?}: tx {}, flushed {}, {} segments",
            edits_dir,
            tx_id,
            flushed_tx_id,
            segments.len()
        );

        Ok(Self {
            edits_dir,
            inner: Mutex::new(LogInner {
                tx_id,
                synced_tx_id: flushed_tx_id,
                flushed_tx_id,
                scheduling: false,
                sync_running: false,
                failed: None,
                buffers: DoubleBuffer::new(config.buffer_limit_bytes),
                segments,
                flush_count: 0,
                bytes_flushed: 0,
            }),
            config,
            state,
            cond: Condvar::new(),
            closing: AtomicBool::new(false),
            cleaner_shutdown: Arc::new(AtomicBool::new(false)),
            cleaner_handle: Mutex::new(None),
        })
    }

    /// Log a new operation under the next transaction id.
    ///
    /// Returns `None` once the log is closing. The caller applies the
    /// operation to the namespace after this returns.
    pub fn append(&self, operation: Operation) -> Result<Option<u64>> {
        self.log_edit(operation, None)
    }

    /// Log a record that already carries its id (standby replay).
    /// The counter advances to the record's id.
    pub fn append_replayed(&self, record: &LogRecord) -> Result<Option<u64>> {
        self.log_edit(record.operation.clone(), Some(record.tx_id))
    }

    fn log_edit(&self, operation: Operation, replay_tx_id: Option<u64>) -> Result<Option<u64>> {
        let tx_id = {
            let mut inner = self.inner.lock();
            while inner.scheduling {
                debug!("Active buffer full, waiting for buffer swap");
                self.cond
                    .wait_for(&mut inner, self.config.wait_interval());
            }

            if let Some(reason) = &inner.failed {
                return Err(Error::durability(reason.clone()));
            }
            if self.closing.load(Ordering::Acquire) {
                debug!("Log closing, dropping {}", operation);
                return Ok(None);
            }

            let tx_id = match replay_tx_id {
                None => {
                    inner.tx_id += 1;
                    inner.tx_id
                }
                Some(tx_id) => {
                    inner.tx_id = inner.tx_id.max(tx_id);
                    tx_id
                }
            };

            let record = LogRecord::new(tx_id, operation);
            if let Err(e) = inner.buffers.write(&record) {
                error!("Failed to buffer record {}: {}", tx_id, e);
            }

            if !inner.buffers.should_sync() {
                return Ok(Some(tx_id));
            }

            debug!(
                "Active buffer {} bytes >= limit {}",
                inner.buffers.current().len(),
                inner.buffers.limit()
            );
            inner.scheduling = true;
            tx_id
        };

        self.log_sync(tx_id, true)?;
        Ok(Some(tx_id))
    }

    /// Group commit: make every record up to `my_tx_id` durable.
    fn log_sync(&self, my_tx_id: u64, scheduled: bool) -> Result<()> {
        let (sync_buffer, target) = {
            let mut inner = self.inner.lock();
            while my_tx_id > inner.synced_tx_id && inner.sync_running {
                debug!(
                    "Waiting for running flush (tx {} > watermark {}), buffer limit {} may be too small",
                    my_tx_id,
                    inner.synced_tx_id,
                    inner.buffers.limit()
                );
                self.cond
                    .wait_for(&mut inner, self.config.wait_interval());
            }

            if let Some(reason) = inner.failed.clone() {
                if scheduled {
                    inner.scheduling = false;
                    self.cond.notify_all();
                }
                return Err(Error::durability(reason));
            }

            if my_tx_id <= inner.synced_tx_id {
                if inner.sync_running {
                    debug!(
                        "tx {} covered by watermark {}, running flush will persist it",
                        my_tx_id, inner.synced_tx_id
                    );
                    if scheduled {
                        inner.scheduling = false;
                        self.cond.notify_all();
                    }
                    return Ok(());
                }
                debug!(
                    "tx {} covered by watermark {}, flushing remaining records",
                    my_tx_id, inner.synced_tx_id
                );
            }

            let sync_buffer = inner.buffers.take_for_sync();
            let last = sync_buffer.last_tx_id();
            inner.synced_tx_id = inner
                .synced_tx_id
                .max(my_tx_id)
                .max(last.unwrap_or(0));
            inner.sync_running = true;
            inner.scheduling = false;
            self.cond.notify_all();

            let target = last.map(|max| FlushedSegment::new(inner.flushed_tx_id + 1, max));
            (sync_buffer, target)
        };

        let result = match target {
            Some(seg) => self.flush_buffer(&sync_buffer, seg),
            None => {
                debug!("No buffered records to flush");
                Ok(())
            }
        };

        let mut inner = self.inner.lock();
        inner.sync_running = false;
        inner.buffers.recycle(sync_buffer);
        if let Err(e) = &result {
            error!("Transaction log flush failed: {}", e);
            inner.failed = Some(e.to_string());
        }
        self.cond.notify_all();
        drop(inner);

        result
    }

    /// Write one segment and record it. Runs with the mutex released.
    fn flush_buffer(&self, buffer: &LogBuffer, seg: FlushedSegment) -> Result<()> {
        let start = Instant::now();

        let path = segment::write_segment(&self.edits_dir, &seg, buffer.as_bytes()).map_err(|e| {
            let _ = fs::remove_file(seg.path_in(&self.edits_dir));
            Error::durability(format!("failed to write segment {seg}: {e}"))
        })?;

        {
            let mut inner = self.inner.lock();
            inner.segments.push(seg);
            inner.flushed_tx_id = seg.max_tx_id;
            inner.flush_count += 1;
            inner.bytes_flushed += buffer.len() as u64;
        }

        self.persist_state()
            .map_err(|e| Error::durability(format!("failed to persist state after {seg}: {e}")))?;

        debug!(
            "Flushed segment {} ({} bytes) to {:?} in {:?}",
            seg,
            buffer.len(),
            path,
            start.elapsed()
        );
        Ok(())
    }

    /// Flush regardless of the threshold and persist the counters.
    ///
    /// Returns once every record appended before the call is on disk.
    pub fn force_flush(&self) -> Result<()> {
        debug!("Force flush");
        let my_tx_id = self.inner.lock().tx_id;
        self.log_sync(my_tx_id, false)?;
        self.wait_for_flush();

        if let Some(reason) = self.inner.lock().failed.clone() {
            return Err(Error::durability(reason));
        }
        self.persist_state()
    }

    /// Block until no flush is running
    fn wait_for_flush(&self) {
        let mut inner = self.inner.lock();
        while inner.sync_running {
            self.cond
                .wait_for(&mut inner, self.config.wait_interval());
        }
    }

    /// Copy counters and the segment list into the durable state and persist it.
    ///
    /// The copy happens under the log mutex, so concurrent callers update the
    /// state in the same order they changed the log; the store's persist lock
    /// then keeps an older copy from landing on disk after a newer one.
    fn persist_state(&self) -> Result<()> {
        {
            let inner = self.inner.lock();
            self.state.update(|s| {
                s.global_tx_id = inner.tx_id;
                s.synced_log_tx_id = inner.synced_tx_id;
                s.flushed_end_tx_id = inner.flushed_tx_id;
                s.flushed_segments.clone_from(&inner.segments);
            });
        }
        self.state.persist()
    }

    /// Delete segment files fully covered by a checkpoint at `checkpoint_tx_id`.
    ///
    /// Walks the ordered list and stops at the first segment that still holds
    /// newer records. Returns the number of segments removed.
    pub fn purge_checkpointed(&self, checkpoint_tx_id: u64) -> Result<usize> {
        let candidates: Vec<FlushedSegment> = self
            .inner
            .lock()
            .segments
            .iter()
            .take_while(|s| s.max_tx_id <= checkpoint_tx_id)
            .copied()
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut removed = Vec::with_capacity(candidates.len());
        for seg in candidates {
            let path = seg.path_in(&self.edits_dir);
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(
                        "Checkpoint tx {} covers {}, deleted {:?}",
                        checkpoint_tx_id, seg, path
                    );
                    removed.push(seg);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed.push(seg),
                Err(e) => {
                    error!("Failed to delete segment {:?}: {}", path, e);
                    break;
                }
            }
        }

        let count = removed.len();
        {
            let mut inner = self.inner.lock();
            let before = inner.segments.len();
            inner.segments.retain(|s| !removed.contains(s));
            debug!(
                "Segment list {} -> {} after cleaning",
                before,
                inner.segments.len()
            );
        }
        if count > 0 {
            self.persist_state()?;
        }
        Ok(count)
    }

    /// Start the background segment cleaner
    pub fn start_cleaner(self: &Arc<Self>) {
        let log: Weak<Self> = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.cleaner_shutdown);
        let interval = self.config.cleaner_interval();

        let handle = thread::spawn(move || {
            info!("Segment cleaner started");

            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);

                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Some(log) = log.upgrade() else {
                    break;
                };

                let (checkpoint_tx_id, _) = log.state.last_checkpoint();
                if let Err(e) = log.purge_checkpointed(checkpoint_tx_id) {
                    warn!("Segment cleaning failed: {}", e);
                }
            }

            info!("Segment cleaner stopped");
        });

        *self.cleaner_handle.lock() = Some(handle);
    }

    fn stop_cleaner(&self) {
        self.cleaner_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.cleaner_handle.lock().take() {
            // The cleaner may hold the last strong reference and be the one
            // running this drop; joining itself would deadlock.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Stop accepting appends, stop the cleaner and flush everything buffered.
    /// Later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let _inner = self.inner.lock();
            self.cond.notify_all();
        }
        self.stop_cleaner();
        self.force_flush()
    }

    /// Records in the active buffer together with the highest id already in
    /// a segment file, or `None` while a flush is running.
    ///
    /// During a flush the swapped-out records are in neither a segment nor
    /// the active buffer, so a reader would see a hole.
    pub fn buffered_records(&self) -> Result<Option<(u64, Vec<LogRecord>)>> {
        let inner = self.inner.lock();
        if inner.sync_running || inner.scheduling {
            return Ok(None);
        }
        let records = inner.buffers.current().records()?;
        Ok(Some((inner.flushed_tx_id, records)))
    }

    /// Snapshot of the flushed-segment list
    pub fn segments(&self) -> Vec<FlushedSegment> {
        self.inner.lock().segments.clone()
    }

    pub fn edits_dir(&self) -> &Path {
        &self.edits_dir
    }

    /// Last transaction id handed out
    pub fn current_tx_id(&self) -> u64 {
        self.inner.lock().tx_id
    }

    /// Flush watermark
    pub fn synced_tx_id(&self) -> u64 {
        self.inner.lock().synced_tx_id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Durable state shared with the checkpoint components
    pub const fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub const fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock();
        LogStats {
            tx_id: inner.tx_id,
            synced_tx_id: inner.synced_tx_id,
            flushed_tx_id: inner.flushed_tx_id,
            segment_count: inner.segments.len(),
            flush_count: inner.flush_count,
            bytes_flushed: inner.bytes_flushed,
            buffered_bytes: inner.buffers.current().len(),
            sync_running: inner.sync_running,
        }
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to flush transaction log on drop: {}", e);
        }
    }
}
