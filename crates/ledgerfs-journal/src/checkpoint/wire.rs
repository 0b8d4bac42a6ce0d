//! Checkpoint upload wire format
//!
//! One upload per connection, big-endian:
//! ```text
//! +----------+-----------+--------+-------------+
//! | maxTxId  | timestamp | length | tree bytes  |
//! | 8B       | 8B        | 4B     | length      |
//! +----------+-----------+--------+-------------+
//! ```
//! The receiver answers with the ASCII bytes `SUCCESS` and closes.

use crate::namespace::Snapshot;
use bytes::{Buf, BufMut, BytesMut};
use ledgerfs_common::{Error, Result};

/// Acknowledgement sent after a checkpoint is durable on the primary
pub const ACK: &[u8] = b"SUCCESS";

/// Header size (max tx id + timestamp + length)
pub const HEADER_SIZE: usize = 20;

/// Upper bound on an accepted tree payload
pub const MAX_TREE_BYTES: usize = 512 * 1024 * 1024; // 512MB

/// Encode a snapshot for upload
pub fn encode(snapshot: &Snapshot) -> Result<BytesMut> {
    let len = u32::try_from(snapshot.tree.len())
        .ok()
        .filter(|len| *len as usize <= MAX_TREE_BYTES)
        .ok_or_else(|| {
            Error::protocol(format!(
                "checkpoint of {} bytes exceeds limit",
                snapshot.tree.len()
            ))
        })?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + snapshot.tree.len());
    buf.put_u64(snapshot.max_tx_id);
    buf.put_u64(snapshot.timestamp);
    buf.put_u32(len);
    buf.put_slice(&snapshot.tree);
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    MaxTxId,
    Timestamp,
    Length,
    Tree(usize),
}

/// Per-connection incremental decoder.
///
/// Bytes arrive in arbitrary pieces. Each field is taken as soon as it is
/// complete; a partial field stays buffered until the next read.
#[derive(Debug)]
pub struct CheckpointDecoder {
    buf: BytesMut,
    field: Field,
    max_tx_id: u64,
    timestamp: u64,
}

impl Default for CheckpointDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            field: Field::MaxTxId,
            max_tx_id: 0,
            timestamp: 0,
        }
    }

    /// Buffer freshly read bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode as far as the buffered bytes allow.
    ///
    /// Returns the snapshot once the whole message arrived and resets for
    /// the next one.
    pub fn decode(&mut self) -> Result<Option<Snapshot>> {
        loop {
            match self.field {
                Field::MaxTxId => {
                    if self.buf.len() < 8 {
                        return Ok(None);
                    }
                    self.max_tx_id = self.buf.get_u64();
                    self.field = Field::Timestamp;
                }
                Field::Timestamp => {
                    if self.buf.len() < 8 {
                        return Ok(None);
                    }
                    self.timestamp = self.buf.get_u64();
                    self.field = Field::Length;
                }
                Field::Length => {
                    if self.buf.len() < 4 {
                        return Ok(None);
                    }
                    let len = self.buf.get_u32() as usize;
                    if len > MAX_TREE_BYTES {
                        return Err(Error::protocol(format!(
                            "checkpoint length {len} exceeds limit"
                        )));
                    }
                    // The buffer grows with the bytes actually received
                    self.field = Field::Tree(len);
                }
                Field::Tree(len) => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let tree = self.buf.split_to(len).to_vec();
                    let snapshot = Snapshot::new(self.max_tx_id, self.timestamp, tree);
                    self.reset();
                    return Ok(Some(snapshot));
                }
            }
        }
    }

    /// Whether a message is partially decoded
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.field != Field::MaxTxId || !self.buf.is_empty()
    }

    fn reset(&mut self) {
        self.field = Field::MaxTxId;
        self.max_tx_id = 0;
        self.timestamp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let snapshot = Snapshot::new(0x0102, 7, b"abc".to_vec());
        let buf = encode(&snapshot).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 3);
        assert_eq!(&buf[..8], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&buf[16..20], &[0, 0, 0, 3]);
        assert_eq!(&buf[20..], b"abc");
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let snapshot = Snapshot::new(42, 1_700_000_000_123, br#"{"name":"/"}"#.to_vec());
        let wire = encode(&snapshot).unwrap();

        let mut decoder = CheckpointDecoder::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            decoder.feed(&[*byte]);
            let result = decoder.decode().unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none());
                assert!(decoder.in_progress());
            } else {
                decoded = result;
            }
        }

        let decoded = decoded.unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.timestamp, snapshot.timestamp);
        assert!(!decoder.in_progress());
    }

    #[test]
    fn test_decode_empty_tree() {
        let wire = encode(&Snapshot::new(1, 2, Vec::new())).unwrap();
        let mut decoder = CheckpointDecoder::new();
        decoder.feed(&wire);
        let decoded = decoder.decode().unwrap().unwrap();
        assert!(decoded.tree.is_empty());
        assert_eq!(decoded.max_tx_id, 1);
    }

    #[test]
    fn test_declared_length_does_not_preallocate() {
        let mut wire = BytesMut::new();
        wire.put_u64(3);
        wire.put_u64(4);
        wire.put_u32(400 * 1024 * 1024);
        wire.put_slice(b"partial");

        let mut decoder = CheckpointDecoder::new();
        decoder.feed(&wire);
        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.in_progress());
        assert!(decoder.buf.capacity() < 1024 * 1024);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut wire = BytesMut::new();
        wire.put_u64(1);
        wire.put_u64(2);
        wire.put_u32(u32::MAX);
        let mut decoder = CheckpointDecoder::new();
        decoder.feed(&wire);
        assert!(decoder.decode().is_err());
    }
}
