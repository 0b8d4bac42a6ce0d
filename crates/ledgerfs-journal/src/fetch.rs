//! Primary-side log fetch
//!
//! Serves "every record after tx N" from flushed segments, falling back to
//! the coordinator's active buffer for records not yet on disk. The records
//! of the most recently read segment stay cached, so a standby paging
//! through one segment reads the file once.
//!
//! Transport, one exchange per connection, big-endian:
//! ```text
//! request:  | syncedTxId u64 | maxCount u32 |
//! response: | length u32 | JSON array of records |
//! ```

use crate::editlog::TransactionLog;
use crate::net::{blocking, io_timeout};
use crate::op::LogRecord;
use crate::replicator::LogSource;
use crate::segment::{self, FlushedSegment};
use async_trait::async_trait;
use ledgerfs_common::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Upper bound on an accepted response body
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024; // 64MB

struct CachedSegment {
    segment: FlushedSegment,
    records: Vec<LogRecord>,
}

/// Reads records out of a [`TransactionLog`]
#[derive(Clone)]
pub struct LogFetcher {
    log: Arc<TransactionLog>,
    max_fetch_size: usize,
    cache: Arc<Mutex<Option<CachedSegment>>>,
}

impl LogFetcher {
    pub fn new(log: Arc<TransactionLog>, max_fetch_size: usize) -> Self {
        Self {
            log,
            max_fetch_size: max_fetch_size.max(1),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Up to `max` records (capped by the configured batch size) with ids
    /// greater than `synced_tx_id`. Blocking.
    pub fn fetch_records(&self, synced_tx_id: u64, max: usize) -> Result<Vec<LogRecord>> {
        let next = synced_tx_id + 1;
        let max = max.min(self.max_fetch_size);
        if max == 0 {
            return Ok(Vec::new());
        }

        // A flush can move records from the buffer into a new segment between
        // the segment lookup and the buffer read; one retry picks them up.
        for _ in 0..2 {
            if let Some(records) = self.from_segments(next, max)? {
                return Ok(records);
            }
            match self.log.buffered_records()? {
                None => {
                    debug!("Flush in flight, nothing to serve after tx {}", synced_tx_id);
                    return Ok(Vec::new());
                }
                Some((flushed_tx_id, records)) if flushed_tx_id < next => {
                    return Ok(take_from(&records, next, max));
                }
                Some(_) => debug!("Segment flushed during fetch after tx {}, retrying", synced_tx_id),
            }
        }
        Ok(Vec::new())
    }

    fn from_segments(&self, next: u64, max: usize) -> Result<Option<Vec<LogRecord>>> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.segment.contains(next) {
                return Ok(Some(take_from(&cached.records, next, max)));
            }
        }

        let segments = self.log.segments();
        let after_cached = cache.as_ref().map(|c| c.segment.max_tx_id + 1);
        let found = segments
            .iter()
            .find(|s| Some(s.min_tx_id) == after_cached && s.contains(next))
            .or_else(|| segments.iter().find(|s| s.contains(next)))
            // Records before the first segment were purged under a checkpoint
            .or_else(|| segments.iter().find(|s| s.min_tx_id > next))
            .copied();
        let Some(seg) = found else {
            return Ok(None);
        };

        let records = segment::read_segment(&seg.path_in(self.log.edits_dir()))?;
        debug!("Loaded segment {} ({} records) for fetch", seg, records.len());
        let batch = take_from(&records, next, max);
        *cache = Some(CachedSegment {
            segment: seg,
            records,
        });
        Ok(Some(batch))
    }
}

/// Records with ids from `next`, at most `max` of them
fn take_from(records: &[LogRecord], next: u64, max: usize) -> Vec<LogRecord> {
    let batch: Vec<LogRecord> = records
        .iter()
        .filter(|r| r.tx_id >= next)
        .take(max)
        .cloned()
        .collect();
    if let Some(first) = batch.first() {
        if first.tx_id > next {
            warn!("Fetch gap: requested tx {}, first available {}", next, first.tx_id);
        }
    }
    batch
}

#[async_trait]
impl LogSource for LogFetcher {
    async fn fetch(&self, synced_tx_id: u64, max: usize) -> Result<Vec<LogRecord>> {
        let fetcher = self.clone();
        blocking(move || fetcher.fetch_records(synced_tx_id, max)).await
    }
}

/// TCP endpoint answering fetch requests from the standby
pub struct FetchService {
    fetcher: LogFetcher,
    io_timeout: Duration,
}

impl FetchService {
    pub fn new(fetcher: LogFetcher, io_timeout: Duration) -> Self {
        Self {
            fetcher,
            io_timeout,
        }
    }

    /// Accept loop. Runs until the task is aborted.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Log fetch service listening on {addr}"),
            Err(e) => warn!("Log fetch service: no local address: {e}"),
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_request(stream, peer).await {
                            warn!("Log fetch from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Log fetch service: accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_request(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let synced_tx_id = io_timeout(self.io_timeout, stream.read_u64()).await?;
        let max = io_timeout(self.io_timeout, stream.read_u32()).await? as usize;

        let records = self.fetcher.fetch(synced_tx_id, max).await?;
        let body = serde_json::to_vec(&records)
            .map_err(|e| Error::Serialization(format!("fetch response: {e}")))?;
        let len = u32::try_from(body.len())
            .map_err(|_| Error::protocol(format!("fetch response of {} bytes", body.len())))?;

        io_timeout(self.io_timeout, stream.write_u32(len)).await?;
        io_timeout(self.io_timeout, stream.write_all(&body)).await?;
        io_timeout(self.io_timeout, stream.shutdown()).await?;
        debug!(
            "Served {} records after tx {} to {peer}",
            records.len(),
            synced_tx_id
        );
        Ok(())
    }
}

/// [`LogSource`] backed by a primary's [`FetchService`]
#[derive(Clone, Debug)]
pub struct RemoteLogSource {
    addr: String,
    io_timeout: Duration,
}

impl RemoteLogSource {
    pub fn new(addr: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            io_timeout,
        }
    }
}

#[async_trait]
impl LogSource for RemoteLogSource {
    async fn fetch(&self, synced_tx_id: u64, max: usize) -> Result<Vec<LogRecord>> {
        let max = u32::try_from(max).unwrap_or(u32::MAX);
        let mut stream = io_timeout(self.io_timeout, TcpStream::connect(&self.addr)).await?;
        io_timeout(self.io_timeout, stream.write_u64(synced_tx_id)).await?;
        io_timeout(self.io_timeout, stream.write_u32(max)).await?;
        io_timeout(self.io_timeout, stream.flush()).await?;

        let len = io_timeout(self.io_timeout, stream.read_u32()).await? as usize;
        if len > MAX_RESPONSE_BYTES {
            return Err(Error::protocol(format!("fetch response length {len} exceeds limit")));
        }
        let mut body = vec![0u8; len];
        io_timeout(self.io_timeout, stream.read_exact(&mut body)).await?;

        serde_json::from_slice(&body)
            .map_err(|e| Error::protocol(format!("malformed fetch response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Operation;
    use crate::state::StateStore;
    use ledgerfs_common::JournalConfig;
    use tempfile::tempdir;

    fn open_log(dir: &std::path::Path) -> Arc<TransactionLog> {
        let state = Arc::new(StateStore::load(dir.join("runtime.repository")).unwrap());
        let config = JournalConfig {
            background_cleaner: false,
            wait_interval_ms: 50,
            ..Default::default()
        };
        Arc::new(TransactionLog::open(dir.join("edits"), config, state, 0).unwrap())
    }

    fn append(log: &TransactionLog, count: usize) {
        for i in 0..count {
            log.append(Operation::MakeDirectory {
                path: format!("/d{i}"),
            })
            .unwrap();
        }
    }

    fn ids(records: &[LogRecord]) -> Vec<u64> {
        records.iter().map(|r| r.tx_id).collect()
    }

    #[test]
    fn test_fetch_across_segments_and_buffer() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        append(&log, 4);
        log.force_flush().unwrap(); // [1,4]
        append(&log, 3);
        log.force_flush().unwrap(); // [5,7]
        append(&log, 2); // 8, 9 buffered

        let fetcher = LogFetcher::new(Arc::clone(&log), 3);
        assert_eq!(ids(&fetcher.fetch_records(0, 10).unwrap()), vec![1, 2, 3]);
        assert_eq!(ids(&fetcher.fetch_records(3, 10).unwrap()), vec![4]);
        assert_eq!(ids(&fetcher.fetch_records(4, 10).unwrap()), vec![5, 6, 7]);
        assert_eq!(ids(&fetcher.fetch_records(7, 10).unwrap()), vec![8, 9]);
        assert!(fetcher.fetch_records(9, 10).unwrap().is_empty());
        assert_eq!(ids(&fetcher.fetch_records(5, 1).unwrap()), vec![6]);
    }

    #[test]
    fn test_fetch_after_purge_skips_ahead() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        append(&log, 3);
        log.force_flush().unwrap(); // [1,3]
        append(&log, 3);
        log.force_flush().unwrap(); // [4,6]
        log.purge_checkpointed(3).unwrap();

        let fetcher = LogFetcher::new(Arc::clone(&log), 10);
        assert_eq!(ids(&fetcher.fetch_records(0, 10).unwrap()), vec![4, 5, 6]);
    }

    #[test]
    fn test_cached_segment_survives_file_removal() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        append(&log, 5);
        log.force_flush().unwrap();

        let fetcher = LogFetcher::new(Arc::clone(&log), 2);
        assert_eq!(ids(&fetcher.fetch_records(0, 2).unwrap()), vec![1, 2]);

        // Served from the cache without touching the file again
        std::fs::remove_file(FlushedSegment::new(1, 5).path_in(log.edits_dir())).unwrap();
        assert_eq!(ids(&fetcher.fetch_records(2, 2).unwrap()), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_remote_fetch_over_tcp() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        append(&log, 6);
        log.force_flush().unwrap();

        let service = Arc::new(FetchService::new(
            LogFetcher::new(Arc::clone(&log), 4),
            Duration::from_secs(5),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Arc::clone(&service).serve(listener));

        let remote = RemoteLogSource::new(addr.to_string(), Duration::from_secs(5));
        let first = remote.fetch(0, 10).await.unwrap();
        assert_eq!(ids(&first), vec![1, 2, 3, 4]);
        assert_eq!(
            first[0].operation,
            Operation::MakeDirectory { path: "/d0".into() }
        );
        assert_eq!(ids(&remote.fetch(4, 10).await.unwrap()), vec![5, 6]);
        assert!(remote.fetch(6, 10).await.unwrap().is_empty());
        server.abort();
    }
}
