//! Log buffer pair
//!
//! Writers append serialized records to the active buffer. When a flush is
//! scheduled the active buffer is taken out whole and handed to the flusher,
//! and the spare buffer becomes active. The flusher gives the drained buffer
//! back so its allocation is reused.

use crate::op::LogRecord;
use ledgerfs_common::Result;

/// Serialized records awaiting a flush
#[derive(Debug, Default)]
pub struct LogBuffer {
    data: Vec<u8>,
    first_tx_id: Option<u64>,
    last_tx_id: u64,
}

impl LogBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            first_tx_id: None,
            last_tx_id: 0,
        }
    }

    /// Append one record as a JSON line
    pub fn write(&mut self, record: &LogRecord) -> Result<()> {
        let mark = self.data.len();
        if let Err(e) = record.encode_into(&mut self.data) {
            self.data.truncate(mark);
            return Err(e);
        }
        self.first_tx_id.get_or_insert(record.tx_id);
        self.last_tx_id = record.tx_id;
        Ok(())
    }

    /// Bytes buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw contents, one record per line
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Id of the first record written since the last clear
    #[must_use]
    pub const fn first_tx_id(&self) -> Option<u64> {
        self.first_tx_id
    }

    /// Id of the most recent record written since the last clear
    #[must_use]
    pub const fn last_tx_id(&self) -> Option<u64> {
        match self.first_tx_id {
            Some(_) => Some(self.last_tx_id),
            None => None,
        }
    }

    /// Decode the buffered records
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        LogRecord::decode_lines(&self.data)
    }

    /// Drop contents but keep the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.first_tx_id = None;
        self.last_tx_id = 0;
    }
}

/// Active buffer plus the spare that replaces it on swap
#[derive(Debug)]
pub struct DoubleBuffer {
    current: LogBuffer,
    spare: Option<LogBuffer>,
    limit: usize,
}

impl DoubleBuffer {
    /// Create a pair that asks for a flush once `limit` bytes are buffered
    #[must_use]
    pub fn new(limit: usize) -> Self {
        // Room for one oversized record past the limit without regrowing
        let capacity = limit.saturating_mul(2);
        Self {
            current: LogBuffer::with_capacity(capacity),
            spare: Some(LogBuffer::with_capacity(capacity)),
            limit,
        }
    }

    /// Append to the active buffer
    pub fn write(&mut self, record: &LogRecord) -> Result<()> {
        self.current.write(record)
    }

    /// Whether the active buffer reached the flush threshold
    #[must_use]
    pub fn should_sync(&self) -> bool {
        self.current.len() >= self.limit
    }

    /// Take the active buffer for flushing; the spare becomes active
    pub fn take_for_sync(&mut self) -> LogBuffer {
        let next = self
            .spare
            .take()
            .unwrap_or_else(|| LogBuffer::with_capacity(self.limit.saturating_mul(2)));
        std::mem::replace(&mut self.current, next)
    }

    /// Return a flushed buffer to the spare slot
    pub fn recycle(&mut self, mut buffer: LogBuffer) {
        buffer.clear();
        self.spare = Some(buffer);
    }

    /// The buffer currently accepting writes
    #[must_use]
    pub const fn current(&self) -> &LogBuffer {
        &self.current
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Operation;

    fn mkdir(tx_id: u64) -> LogRecord {
        LogRecord::new(
            tx_id,
            Operation::MakeDirectory {
                path: format!("/dir{tx_id}"),
            },
        )
    }

    #[test]
    fn test_buffer_tracks_range() {
        let mut buf = LogBuffer::default();
        assert_eq!(buf.last_tx_id(), None);
        buf.write(&mkdir(4)).unwrap();
        buf.write(&mkdir(5)).unwrap();
        assert_eq!(buf.first_tx_id(), Some(4));
        assert_eq!(buf.last_tx_id(), Some(5));
        assert_eq!(buf.records().unwrap().len(), 2);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.first_tx_id(), None);
    }

    #[test]
    fn test_double_buffer_swap_and_recycle() {
        let mut pair = DoubleBuffer::new(64);
        let mut tx = 0;
        while !pair.should_sync() {
            tx += 1;
            pair.write(&mkdir(tx)).unwrap();
        }

        let sync = pair.take_for_sync();
        assert!(pair.current().is_empty());
        assert_eq!(sync.last_tx_id(), Some(tx));

        pair.write(&mkdir(tx + 1)).unwrap();
        pair.recycle(sync);
        let next = pair.take_for_sync();
        assert_eq!(next.first_tx_id(), Some(tx + 1));
        // Recycled buffer came back empty
        assert!(pair.current().is_empty());
    }
}
