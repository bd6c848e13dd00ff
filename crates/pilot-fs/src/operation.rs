//! Append-log records.
//!
//! A log is a plain concatenation of bincode-encoded [`FileOperation`]s
//! (fixed-width little-endian integers): offset, length-prefixed data,
//! operation tag, timestamp. There is no header, so appending never has to
//! look at what is already in the file.

use crate::Result;
use pilot_config::log_fs_warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Write,
    /// Shrink to `offset` bytes; never grows the file.
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub offset: u64,
    pub data: Vec<u8>,
    pub op: OpType,
    /// Milliseconds since the Unix epoch when the operation was recorded
    pub timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl FileOperation {
    pub fn write(offset: u64, data: &[u8]) -> Self {
        Self {
            offset,
            data: data.to_vec(),
            op: OpType::Write,
            timestamp_ms: now_ms(),
        }
    }

    pub fn truncate(size: u64) -> Self {
        Self {
            offset: size,
            data: Vec::new(),
            op: OpType::Truncate,
            timestamp_ms: now_ms(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replay onto a materialized copy.
    pub fn apply(&self, file: &mut File) -> io::Result<()> {
        match self.op {
            OpType::Write => {
                file.seek(SeekFrom::Start(self.offset))?;
                file.write_all(&self.data)
            }
            OpType::Truncate => {
                if self.offset < file.metadata()?.len() {
                    file.set_len(self.offset)?;
                }
                Ok(())
            }
        }
    }

    pub fn encode_into<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }
}

/// Decode a whole log. A record cut short at the end of the buffer (a
/// torn append) ends the log; anything else malformed is an error.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<FileOperation>> {
    let mut operations = Vec::new();
    let mut cursor = bytes;
    while !cursor.is_empty() {
        match bincode::deserialize_from::<_, FileOperation>(&mut cursor) {
            Ok(operation) => operations.push(operation),
            Err(err) => {
                if let bincode::ErrorKind::Io(io_err) = err.as_ref() {
                    if io_err.kind() == io::ErrorKind::UnexpectedEof {
                        log_fs_warn!(
                            "Ignoring torn record at end of append log",
                            decoded = operations.len()
                        );
                        break;
                    }
                }
                return Err(err.into());
            }
        }
    }
    Ok(operations)
}
