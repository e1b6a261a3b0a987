//! # Block Registry
//!
//! The authoritative directory of which logical blocks exist and where
//! their bytes live. Each block name maps to a [`BlockEntry`]
//! `{name, offset, length, checksum}`.
//!
//! ## Checksums
//!
//! The 32-byte SHA-256 digest of a block is computed over the exact payload
//! bytes *before* they are written (see [`BlockEntry::for_payload`]). A
//! mismatch on read therefore always means the bytes changed on disk, never
//! that the checksum was computed over a different buffer.
//!
//! ## Replace, never mutate
//!
//! An update produces a new entry at a new offset. [`Registry::put`]
//! returns the replaced entry so the caller can give its extent back to the
//! free-space manager. Entries are never edited in place, which is what
//! makes REDO-only recovery sufficient.
//!
//! ## Persistence
//!
//! The in-memory map is written out as a sealed directory
//! (`[magic "BDIR"][u32 count][entries…][crc32]`) at checkpoint time. The
//! registry only tracks how many mutations happened since the last
//! checkpoint; the engine decides when to persist, based on a dirty-count
//! and an elapsed-time threshold.
//!
//! ## Thread safety
//!
//! The map sits behind an `RwLock`: lookups run concurrently, upserts and
//! removals take the write lock for the duration of a single map operation.


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::HashMap,
    sync::{
        Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::fsm::Extent;
use crc32fast::Hasher as Crc32;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Length of a block checksum in bytes.
pub const CHECKSUM_LEN: usize = 32;

const DIRECTORY_MAGIC: [u8; 4] = *b"BDIR";
const U32_SIZE: usize = std::mem::size_of::<u32>();

/// SHA-256 digest of a block payload.
pub type Checksum = [u8; CHECKSUM_LEN];

/// Computes the block checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> Checksum {
    Sha256::digest(bytes).into()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Stored bytes no longer match the recorded checksum.
    #[error("checksum mismatch for block '{0}'")]
    Corruption(String),

    /// Persisted directory failed its CRC check.
    #[error("directory checksum mismatch")]
    DirectoryChecksumMismatch,

    /// Persisted directory is structurally invalid.
    #[error("invalid directory: {0}")]
    InvalidDirectory(String),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// BlockEntry
// ------------------------------------------------------------------------------------------------

/// Location and checksum of one stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// Logical block name.
    pub name: String,

    /// Byte offset of the first payload byte (page-aligned).
    pub offset: u64,

    /// Payload length in bytes.
    pub length: u64,

    /// SHA-256 of the payload.
    pub checksum: Checksum,
}

impl BlockEntry {
    /// Builds the entry for `payload` stored at `offset`, hashing the
    /// payload itself.
    pub fn for_payload(name: impl Into<String>, offset: u64, payload: &[u8]) -> Self {
        Self {
            name: name.into(),
            offset,
            length: payload.len() as u64,
            checksum: checksum(payload),
        }
    }

    /// Pages occupied by this block.
    pub fn extent(&self, page_size: u64) -> Extent {
        Extent::from_bytes(self.offset, self.length, page_size)
    }

    /// Verifies that `bytes` are the bytes this entry was created for.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), RegistryError> {
        if bytes.len() as u64 != self.length || checksum(bytes) != self.checksum {
            error!(name = %self.name, offset = self.offset, "block checksum mismatch");
            return Err(RegistryError::Corruption(self.name.clone()));
        }
        Ok(())
    }
}

impl Encode for BlockEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.length.encode_to(buf)?;
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (block_offset, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (length, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (checksum, n) = <Checksum>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                name,
                offset: block_offset,
                length,
                checksum,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Registry core
// ------------------------------------------------------------------------------------------------

/// In-memory name → [`BlockEntry`] table of one open vault.
#[derive(Debug)]
pub struct Registry {
    /// Live entries.
    entries: RwLock<HashMap<String, BlockEntry>>,

    /// Mutations since the last persisted directory.
    dirty: AtomicU64,

    /// When the directory was last persisted.
    last_persisted: Mutex<Instant>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_entries(HashMap::new())
    }

    fn with_entries(entries: HashMap<String, BlockEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            dirty: AtomicU64::new(0),
            last_persisted: Mutex::new(Instant::now()),
        }
    }

    fn read_map(&self) -> Result<RwLockReadGuard<'_, HashMap<String, BlockEntry>>, RegistryError> {
        self.entries
            .read()
            .map_err(|_| RegistryError::Internal("RwLock poisoned".into()))
    }

    fn write_map(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, BlockEntry>>, RegistryError> {
        self.entries
            .write()
            .map_err(|_| RegistryError::Internal("RwLock poisoned".into()))
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: &str) -> Result<Option<BlockEntry>, RegistryError> {
        Ok(self.read_map()?.get(name).cloned())
    }

    /// Returns `true` if a block with this name exists.
    pub fn contains(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self.read_map()?.contains_key(name))
    }

    /// Upserts an entry, returning the one it replaced.
    pub fn put(&self, entry: BlockEntry) -> Result<Option<BlockEntry>, RegistryError> {
        let previous = self.write_map()?.insert(entry.name.clone(), entry);
        self.dirty.fetch_add(1, Ordering::AcqRel);
        Ok(previous)
    }

    /// Removes an entry, returning it if it existed.
    pub fn remove(&self, name: &str) -> Result<Option<BlockEntry>, RegistryError> {
        let removed = self.write_map()?.remove(name);
        if removed.is_some() {
            self.dirty.fetch_add(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    /// Number of live blocks.
    pub fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.read_map()?.len())
    }

    /// Returns `true` when no block is registered.
    #[cfg(test)]
    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.read_map()?.is_empty())
    }

    /// Names starting with `prefix`, in ascending order.
    pub fn names_with_prefix(&self, prefix: &str) -> Result<Vec<String>, RegistryError> {
        let mut names: Vec<String> = self
            .read_map()?
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    /// All entries, sorted by name.
    pub fn entries(&self) -> Result<Vec<BlockEntry>, RegistryError> {
        let mut entries: Vec<BlockEntry> = self.read_map()?.values().cloned().collect();
        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    // --------------------------------------------------------------------------------------------
    // Dirty tracking
    // --------------------------------------------------------------------------------------------

    /// Mutations since the directory was last persisted.
    pub fn dirty_count(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    /// `true` once `threshold` mutations accumulated, or any mutation is
    /// older than `interval`.
    pub fn persist_due(&self, threshold: u64, interval: Duration) -> Result<bool, RegistryError> {
        let dirty = self.dirty_count();
        if dirty == 0 {
            return Ok(false);
        }
        if dirty >= threshold {
            return Ok(true);
        }
        let last = self
            .last_persisted
            .lock()
            .map_err(|_| RegistryError::Internal("Mutex poisoned".into()))?;
        Ok(last.elapsed() >= interval)
    }

    /// Records that the directory up to `persisted` mutations is on disk.
    ///
    /// Mutations that raced with the checkpoint stay counted.
    pub fn mark_persisted(&self, persisted: u64) -> Result<(), RegistryError> {
        self.dirty.fetch_sub(persisted.min(self.dirty_count()), Ordering::AcqRel);
        *self
            .last_persisted
            .lock()
            .map_err(|_| RegistryError::Internal("Mutex poisoned".into()))? = Instant::now();
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Directory (de)serialization
    // --------------------------------------------------------------------------------------------

    /// Writes the sealed directory into `buf` and returns the number of
    /// dirty mutations it covers.
    pub fn seal_directory(&self, buf: &mut Vec<u8>) -> Result<u64, RegistryError> {
        let map = self.read_map()?;
        let covered = self.dirty_count();

        let mut entries: Vec<&BlockEntry> = map.values().collect();
        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        let start = buf.len();
        buf.extend_from_slice(&DIRECTORY_MAGIC);
        encoding::len_to_u32(entries.len())?.encode_to(buf)?;
        for entry in entries {
            entry.encode_to(buf)?;
        }

        let mut hasher = Crc32::new();
        hasher.update(&buf[start..]);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        debug!(
            entries = map.len(),
            bytes = buf.len() - start,
            "registry directory sealed"
        );
        Ok(covered)
    }

    /// Rebuilds a registry from a sealed directory in one pass.
    pub fn from_directory(bytes: &[u8]) -> Result<Self, RegistryError> {
        if bytes.len() < DIRECTORY_MAGIC.len() + 2 * U32_SIZE || bytes[..4] != DIRECTORY_MAGIC {
            return Err(RegistryError::InvalidDirectory("bad magic".into()));
        }

        let mut offset = DIRECTORY_MAGIC.len();
        let (count, n) = u32::decode_from(&bytes[offset..])?;
        offset += n;

        let mut map = HashMap::with_capacity((count as usize).min(1 << 20));
        for _ in 0..count {
            let (entry, n) = BlockEntry::decode_from(&bytes[offset..])?;
            offset += n;
            if map.insert(entry.name.clone(), entry).is_some() {
                return Err(RegistryError::InvalidDirectory("duplicate block name".into()));
            }
        }

        let (stored, _) = u32::decode_from(&bytes[offset..])?;
        let mut hasher = Crc32::new();
        hasher.update(&bytes[..offset]);
        if hasher.finalize() != stored {
            return Err(RegistryError::DirectoryChecksumMismatch);
        }

        Ok(Self::with_entries(map))
    }
}
