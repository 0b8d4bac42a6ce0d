//! Namespace operations and log records
//!
//! A record is one JSON object per line in a log segment, prefixed with the
//! CRC32C of the JSON bytes as eight hex digits:
//! ```text
//! 0f3c81a2 {"txId":7,"operation":{"type":"makeDirectory","path":"/a/b"}}
//! 9b04d7e5 {"txId":8,"operation":{"type":"createFile","fileName":"/a/b/c.txt"}}
//! ```

use ledgerfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex digits of the per-line checksum
const CRC_HEX_LEN: usize = 8;

/// One namespace mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    /// Create every missing directory along `path`
    MakeDirectory { path: String },
    /// Create a file under an existing parent directory
    #[serde(rename_all = "camelCase")]
    CreateFile { file_name: String },
}

impl Operation {
    /// Short name used in logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MakeDirectory { .. } => "makeDirectory",
            Self::CreateFile { .. } => "createFile",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MakeDirectory { path } => write!(f, "mkdir {path}"),
            Self::CreateFile { file_name } => write!(f, "create {file_name}"),
        }
    }
}

/// An operation tagged with its transaction id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub tx_id: u64,
    pub operation: Operation,
}

impl LogRecord {
    pub const fn new(tx_id: u64, operation: Operation) -> Self {
        Self { tx_id, operation }
    }

    /// Append this record, its checksum and the line terminator to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("log record {}: {}", self.tx_id, e)))?;
        let crc = crc32c::crc32c(&json);
        buf.extend_from_slice(format!("{crc:08x} ").as_bytes());
        buf.extend_from_slice(&json);
        buf.push(b'\n');
        Ok(())
    }

    /// Parse one line, verifying its checksum
    pub fn decode_line(line: &[u8]) -> Result<Self> {
        let (Some(crc_hex), Some(b' ')) = (line.get(..CRC_HEX_LEN), line.get(CRC_HEX_LEN)) else {
            return Err(Error::Deserialization("log record: missing checksum".into()));
        };
        let stored = std::str::from_utf8(crc_hex)
            .ok()
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .ok_or_else(|| Error::Deserialization("log record: malformed checksum".into()))?;

        let json = &line[CRC_HEX_LEN + 1..];
        let computed = crc32c::crc32c(json);
        if computed != stored {
            return Err(Error::Deserialization(format!(
                "log record checksum mismatch: stored {stored:08x}, computed {computed:08x}"
            )));
        }
        serde_json::from_slice(json).map_err(|e| Error::Deserialization(format!("log record: {e}")))
    }

    /// Parse newline separated records, skipping blank lines.
    /// Any damaged record fails the whole batch.
    pub fn decode_lines(data: &[u8]) -> Result<Vec<Self>> {
        let decoded = Self::decode_prefix(data);
        match decoded.error {
            Some(e) => Err(e),
            None => Ok(decoded.records),
        }
    }

    /// Parse records until the first damaged one
    #[must_use]
    pub fn decode_prefix(data: &[u8]) -> DecodedPrefix {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let rest = &data[offset..];
            let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
                Some(end) => (&rest[..end], end + 1),
                None => (rest, rest.len()),
            };
            if !line.iter().all(u8::is_ascii_whitespace) {
                match Self::decode_line(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        return DecodedPrefix {
                            records,
                            valid_len: offset,
                            error: Some(e),
                        };
                    }
                }
            }
            offset += consumed;
        }
        DecodedPrefix {
            records,
            valid_len: data.len(),
            error: None,
        }
    }
}

/// Result of [`LogRecord::decode_prefix`]
#[derive(Debug)]
pub struct DecodedPrefix {
    /// Records before the first damaged line
    pub records: Vec<LogRecord>,
    /// Bytes covered by `records`
    pub valid_len: usize,
    /// Why decoding stopped early, if it did
    pub error: Option<Error>,
}
