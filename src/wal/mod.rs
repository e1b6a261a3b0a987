//! # Durability Log
//!
//! Append-only, CRC-protected log of block mutations living in a fixed
//! region of the vault file. Every mutation reaches the log before it
//! touches block storage; after a crash the log is scanned and the
//! committed mutations are re-applied (REDO only, nothing is ever undone).
//!
//! ## Record framing
//!
//! ```text
//! [seq u64][op u8][name_len u32][name][payload_len u32][payload][crc32 u32]
//! ```
//!
//! All integers are little-endian. The CRC covers every byte of the record
//! before it. `op` is `1 = Put`, `2 = Delete`, `3 = Commit`. A Commit record
//! closes a group: only records followed by a Commit are ever replayed, so a
//! batch is applied entirely or not at all.
//!
//! ## Sequence continuity
//!
//! Sequence ids are contiguous over the whole life of a file. Replay starts
//! at `checkpoint_seq + 1` and stops at the first record that fails its CRC,
//! fails to decode, or does not carry the next expected id. That single rule
//! handles torn tails and the leftovers of a reset or relocated region
//! alike, since every stale record carries an id at or below the checkpoint.
//! Zeroed space where a record would start (`seq` and `op` both zero) is a
//! clean end of data.
//!
//! ## Retries
//!
//! Appends go out as one positioned write followed by a data sync. Writes
//! that fail with a transient error kind are retried a bounded number of
//! times with a doubling backoff; rewriting the same bytes at the same
//! offset is idempotent.

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io, os::unix::fs::FileExt, thread, time::Duration};

use crate::encoding::{Decode, Encode, EncodingError};
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{error, info, trace, warn};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// `seq + op`.
const PREFIX_LEN: usize = 8 + 1;

/// Bytes a framed record needs on top of its name and payload.
///
/// `seq + op + name_len + payload_len + crc`.
pub const RECORD_OVERHEAD: u64 = (PREFIX_LEN + U32_SIZE + U32_SIZE + U32_SIZE) as u64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure: checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Record was cut short by the end of the region.
    #[error("Unexpected end of log")]
    UnexpectedEof,

    /// Record carries an id other than the next expected one.
    #[error("sequence break: expected {expected}, found {found}")]
    SequenceBreak {
        /// Next id replay was waiting for.
        expected: u64,
        /// Id stored in the record.
        found: u64,
    },

    /// Frame does not fit in the remaining log space.
    #[error("log region full: need {needed} bytes, {available} available")]
    RegionFull {
        /// Bytes the append needs.
        needed: u64,
        /// Bytes left in the region.
        available: u64,
    },

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    /// Upsert of a block.
    Put,
    /// Removal of a block.
    Delete,
    /// Closes the group of records written since the previous Commit.
    Commit,
}

impl LogOp {
    fn tag(self) -> u8 {
        match self {
            LogOp::Put => 1,
            LogOp::Delete => 2,
            LogOp::Commit => 3,
        }
    }
}

impl TryFrom<u8> for LogOp {
    type Error = EncodingError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(LogOp::Put),
            2 => Ok(LogOp::Delete),
            3 => Ok(LogOp::Commit),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "LogOp",
            }),
        }
    }
}

/// One durable mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position in the global sequence.
    pub seq: u64,

    /// Kind of mutation.
    pub op: LogOp,

    /// Target block (empty for Commit).
    pub name: String,

    /// New contents (empty for Delete and Commit).
    pub payload: Vec<u8>,
}

#[cfg(test)]
impl LogRecord {
    pub fn put(seq: u64, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            seq,
            op: LogOp::Put,
            name: name.into(),
            payload,
        }
    }

    pub fn delete(seq: u64, name: impl Into<String>) -> Self {
        Self {
            seq,
            op: LogOp::Delete,
            name: name.into(),
            payload: Vec::new(),
        }
    }

    pub fn commit(seq: u64) -> Self {
        Self {
            seq,
            op: LogOp::Commit,
            name: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn framed_len(&self) -> u64 {
        framed_len(self.name.len(), self.payload.len())
    }
}

/// Size of a framed record with the given name and payload lengths.
pub fn framed_len(name_len: usize, payload_len: usize) -> u64 {
    RECORD_OVERHEAD + name_len as u64 + payload_len as u64
}

impl Encode for LogRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.op.tag().encode_to(buf)?;
        self.name.encode_to(buf)?;
        self.payload.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for LogRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (payload, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                seq,
                op: LogOp::try_from(tag)?,
                name,
                payload,
            },
            offset,
        ))
    }
}

fn frame_crc(record: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(record);
    hasher.finalize()
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + U32_SIZE)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Frames a record from borrowed parts, without building a [`LogRecord`].
pub fn frame_op(
    seq: u64,
    op: LogOp,
    name: &str,
    payload: &[u8],
    buf: &mut Vec<u8>,
) -> Result<(), WalError> {
    let start = buf.len();
    seq.encode_to(buf)?;
    op.tag().encode_to(buf)?;
    name.encode_to(buf)?;
    payload.encode_to(buf)?;

    let crc = frame_crc(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Appends the framed form of `record` to `buf`.
#[cfg(test)]
pub fn frame_into(record: &LogRecord, buf: &mut Vec<u8>) -> Result<(), WalError> {
    frame_op(record.seq, record.op, &record.name, &record.payload, buf)
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Streaming decoder over the bytes of a log region.
///
/// Yields records in order and enforces sequence continuity. Iteration ends
/// (`None`) at a clean end of data; any damage is reported once as an error
/// and the iterator is fused afterwards.
pub struct LogIter<'a> {
    buf: &'a [u8],
    offset: usize,
    next_seq: u64,
    max_record_size: usize,
    done: bool,
}

impl<'a> LogIter<'a> {
    /// Iterates `buf` from its start, expecting `first_seq` as the first id.
    pub fn new(buf: &'a [u8], first_seq: u64, max_record_size: usize) -> Self {
        Self {
            buf,
            offset: 0,
            next_seq: first_seq,
            max_record_size,
            done: false,
        }
    }

    /// Byte offset just past the last record yielded.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read_frame(&mut self) -> Option<Result<LogRecord, WalError>> {
        let rest = &self.buf[self.offset..];
        if rest.len() < PREFIX_LEN + U32_SIZE {
            return None;
        }
        // Zeroed space: never written.
        if rest[..PREFIX_LEN].iter().all(|b| *b == 0) {
            return None;
        }

        let mut end = PREFIX_LEN;
        for _ in 0..2 {
            let Some(len) = read_u32(rest, end) else {
                return Some(Err(WalError::UnexpectedEof));
            };
            let len = len as usize;
            if len > self.max_record_size {
                return Some(Err(WalError::RecordTooLarge(len)));
            }
            end += U32_SIZE + len;
        }
        let Some(stored) = read_u32(rest, end) else {
            return Some(Err(WalError::UnexpectedEof));
        };
        if stored != frame_crc(&rest[..end]) {
            return Some(Err(WalError::ChecksumMismatch));
        }

        let record = match LogRecord::decode_from(&rest[..end]) {
            Ok((record, _)) => record,
            Err(e) => return Some(Err(WalError::Encoding(e))),
        };
        if record.seq != self.next_seq {
            return Some(Err(WalError::SequenceBreak {
                expected: self.next_seq,
                found: record.seq,
            }));
        }

        trace!(seq = record.seq, op = ?record.op, "log record read");
        self.offset += end + U32_SIZE;
        self.next_seq += 1;
        Some(Ok(record))
    }
}

impl Iterator for LogIter<'_> {
    type Item = Result<LogRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.read_frame();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// A run of mutations closed by a Commit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitGroup {
    /// Id of the closing Commit record.
    pub commit_seq: u64,

    /// Put / Delete records of the group, in log order.
    pub records: Vec<LogRecord>,
}

/// Result of scanning a log region.
#[derive(Debug, Default)]
pub struct Replay {
    /// Complete groups, oldest first.
    pub groups: Vec<CommitGroup>,

    /// Offset right after the last Commit; new appends start here.
    pub tail: u64,

    /// Id of the last Commit (or the starting point if none).
    pub last_seq: u64,

    /// Records seen after the last Commit and dropped.
    pub discarded: usize,

    /// Why the scan stopped, if it was not a clean end of data.
    pub stopped_by: Option<String>,
}

/// Scans `buf` and returns every committed group following `checkpoint_seq`.
pub fn replay(buf: &[u8], checkpoint_seq: u64, max_record_size: usize) -> Replay {
    let mut iter = LogIter::new(buf, checkpoint_seq + 1, max_record_size);
    let mut out = Replay {
        last_seq: checkpoint_seq,
        ..Replay::default()
    };
    let mut open: Vec<LogRecord> = Vec::new();

    while let Some(item) = iter.next() {
        match item {
            Ok(record) if record.op == LogOp::Commit => {
                out.groups.push(CommitGroup {
                    commit_seq: record.seq,
                    records: std::mem::take(&mut open),
                });
                out.last_seq = record.seq;
                out.tail = iter.offset() as u64;
            }
            Ok(record) => open.push(record),
            Err(e) => {
                warn!("log scan stopped: {e}");
                out.stopped_by = Some(e.to_string());
            }
        }
    }

    out.discarded = open.len();

    if out.discarded > 0 {
        warn!(
            discarded = out.discarded,
            "dropping log records without a commit"
        );
    }
    info!(
        groups = out.groups.len(),
        last_seq = out.last_seq,
        tail = out.tail,
        "log scan complete"
    );
    out
}

// ------------------------------------------------------------------------------------------------
// Retry policy
// ------------------------------------------------------------------------------------------------

/// Bounded retry with doubling backoff for transient I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,

    /// Delay before the first retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Runs `op`, retrying transient failures.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.retries && is_transient(&e) => {
                    attempt += 1;
                    warn!(attempt, ?delay, "transient failure during {what}: {e}");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(attempt, "{what} failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Error kinds worth another attempt.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ------------------------------------------------------------------------------------------------
// Log region
// ------------------------------------------------------------------------------------------------

/// Append cursor over the log area of the vault file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRegion {
    /// File offset of the region.
    offset: u64,

    /// Region size in bytes.
    capacity: u64,

    /// Bytes in use.
    tail: u64,
}

impl LogRegion {
    pub fn new(offset: u64, capacity: u64, tail: u64) -> Self {
        Self { offset, capacity, tail }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Bytes still available.
    pub fn remaining(&self) -> u64 {
        self.capacity - self.tail
    }

    /// Largest record the region could ever hold.
    pub fn max_record_size(&self) -> usize {
        usize::try_from(self.capacity).unwrap_or(usize::MAX)
    }

    /// Forgets all records. The bytes stay on disk and are fenced off by
    /// sequence continuity.
    pub fn reset(&mut self) {
        self.tail = 0;
    }

    /// Writes `frames` at the tail and makes them durable.
    ///
    /// On error the tail is left unchanged, so a later append overwrites the
    /// partial frames.
    pub fn append(&mut self, file: &File, frames: &[u8], retry: &RetryPolicy) -> Result<(), WalError> {
        let needed = frames.len() as u64;
        if needed > self.remaining() {
            return Err(WalError::RegionFull {
                needed,
                available: self.remaining(),
            });
        }

        let at = self.offset + self.tail;
        retry.run("log write", || file.write_all_at(frames, at))?;
        retry.run("log sync", || file.sync_data())?;
        self.tail += needed;

        trace!(bytes = needed, tail = self.tail, "log frames appended");
        Ok(())
    }
}
