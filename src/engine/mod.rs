//! # Block Storage Engine
//!
//! Orchestrates the free-space manager, the block registry, the batcher and
//! the durability log over a single backing file.
//!
//! ## File layout
//!
//! ```text
//! page 0        two header slots (see header.rs)
//! log region    reserved pages; location recorded in the header
//! directory     FSM-allocated extent, rewritten at every checkpoint
//! free map      FSM-allocated extent, rewritten at every checkpoint
//! data          block extents
//! ```
//!
//! ## Write path
//!
//! 1. `write` / `delete` stage the mutation in the [`Batcher`] and return.
//! 2. A flush moves the accumulating set in flight, frames it as log
//!    records with consecutive sequence ids plus one Commit record, and
//!    writes all frames with a single write and a single sync.
//! 3. Each record is then applied: a put allocates a fresh extent, writes
//!    the payload there, swaps the registry entry and frees the old extent.
//!    A delete removes the entry and frees its extent.
//!
//! ## Checkpoint
//!
//! The registry directory and the free map are written into freshly
//! allocated extents, then the header slot that is not current is rewritten
//! with a higher generation. Only after that sync does the log region start
//! over. A crash at any point leaves either the old or the new header in
//! force, each pointing at a complete directory / map pair.
//!
//! ## Recovery
//!
//! Open reads the winning header, restores the free map and directory, maps
//! the log region and re-applies every committed group after
//! `checkpoint_seq`. Applying a record twice yields the same registry
//! content, so a crash during recovery is harmless. A checkpoint follows
//! immediately so the replayed log is not needed again.
//!
//! ## Concurrency
//!
//! - Block names hash onto [`utils::STRIPES`] `RwLock`s. Reads hold the
//!   stripe shared while they copy bytes out, so the extent they read
//!   cannot be freed and reused underneath them. Registry swaps take it
//!   exclusively.
//! - Flushes and checkpoints serialize on the durable-state mutex.
//! - Lock order: stripe → batcher → registry → fsm; the durable-state mutex
//!   is taken before any stripe.
//!
//! ## Failure
//!
//! Any error during a flush or checkpoint moves the engine into a failed
//! state. Every later call returns [`EngineError::Failed`]; the file is left
//! for recovery on the next open.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use memmap2::MmapOptions;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{BatchError, BatchStats, Batcher, Pending, PendingOp, WriteSet};
use crate::encoding::EncodingError;
use crate::fsm::{Backing, Extent, FreeMapSnapshot, FreeSpaceManager, FsmError, FsmStats, pages_for};
use crate::registry::{BlockEntry, Checksum, Registry, RegistryError};
use crate::wal::{self, LogOp, LogRegion, RetryPolicy, WalError, frame_op, framed_len};

pub mod header;
pub mod pool;
pub mod utils;

use header::{FileHeader, MIN_PAGE_SIZE, SLOT_SIZE};
use pool::BufferPool;
pub use utils::CancelToken;

#[cfg(test)]
mod tests;

/// Longest accepted block name in bytes.
pub const MAX_NAME_LEN: usize = 4096;

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSED: u8 = 1;
const STATUS_FAILED: u8 = 2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the free-space manager.
    #[error("FSM error: {0}")]
    Fsm(#[from] FsmError),

    /// Error originating from the block registry.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error originating from the durability log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the batcher.
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No block with this name.
    #[error("block '{0}' not found")]
    NotFound(String),

    /// Caller-supplied value out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Header page unreadable.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Persisted metadata contradicts itself.
    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),

    /// The operation's cancel token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine was closed.
    #[error("engine is closed")]
    Closed,

    /// An earlier flush or checkpoint failed.
    #[error("engine failed: {0}")]
    Failed(String),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Allocation unit in bytes. Ignored when opening an existing file.
    pub page_size: u64,

    /// Pages added by the first file extension.
    pub initial_extension_pages: u64,

    /// Multiplier applied to each following extension.
    pub growth_factor: u64,

    /// Initial size of the log region in bytes.
    pub log_region_size: u64,

    /// Largest accepted block payload in bytes.
    pub max_block_size: u64,

    /// Accumulated records that trigger a flush.
    pub flush_max_records: usize,

    /// Accumulated framed bytes that trigger a flush.
    pub flush_max_bytes: u64,

    /// Age of the accumulating set that triggers a timer flush.
    pub flush_interval: Duration,

    /// Registry mutations that trigger a checkpoint.
    pub checkpoint_dirty_threshold: u64,

    /// Age of the oldest unpersisted mutation that triggers a checkpoint.
    pub checkpoint_interval: Duration,

    /// Retry policy for transient flush I/O failures.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            initial_extension_pages: 256,
            growth_factor: 2,
            log_region_size: 4 * 1024 * 1024,
            max_block_size: 64 * 1024 * 1024,
            flush_max_records: 1024,
            flush_max_bytes: 4 * 1024 * 1024,
            flush_interval: Duration::from_millis(50),
            checkpoint_dirty_threshold: 4096,
            checkpoint_interval: Duration::from_secs(1),
            retry: RetryPolicy {
                retries: 3,
                backoff: Duration::from_millis(5),
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Location of a stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStat {
    pub offset: u64,
    pub length: u64,
    pub checksum: Checksum,
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Blocks in the registry (excludes buffered writes).
    pub blocks: usize,
    /// Current header generation.
    pub generation: u64,
    /// Sequence id covered by the last checkpoint.
    pub checkpoint_seq: u64,
    /// Last sequence id written to the log.
    pub last_seq: u64,
    /// Log region size in bytes.
    pub log_capacity: u64,
    /// Log bytes in use.
    pub log_used: u64,
    /// Registry mutations not yet checkpointed.
    pub dirty: u64,
    /// Completed flushes since open.
    pub flushes: u64,
    /// Completed checkpoints since open.
    pub checkpoints: u64,
    /// Commit groups re-applied during open.
    pub recovered_groups: u64,
    pub fsm: FsmStats,
    pub batch: BatchStats,
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// Grows the vault file on behalf of the FSM.
struct FileBacking<'a> {
    file: &'a File,
    #[cfg(test)]
    refuse_growth: bool,
}

impl Backing for FileBacking<'_> {
    fn resize(&self, len: u64) -> io::Result<()> {
        #[cfg(test)]
        if self.refuse_growth {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "growth refused"));
        }
        self.file.set_len(len)
    }
}

/// Metadata and log position recovered from the file.
struct Restored {
    fsm: FreeSpaceManager,
    registry: Registry,
    log_tail: u64,
    last_seq: u64,
}

/// Failure switches flipped by tests.
#[cfg(test)]
#[derive(Debug, Default)]
struct TestHooks {
    fail_next_flush: std::sync::atomic::AtomicBool,
    fail_next_header: std::sync::atomic::AtomicBool,
    refuse_growth: std::sync::atomic::AtomicBool,
}

/// State owned by whoever flushes or checkpoints.
#[derive(Debug)]
struct DurableState {
    header: FileHeader,
    log: LogRegion,
    /// Last sequence id written to the log.
    last_seq: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    checkpoints: AtomicU64,
    recovered_groups: AtomicU64,
}

#[derive(Debug)]
struct EngineInner {
    path: PathBuf,
    file: File,
    config: EngineConfig,
    page_size: u64,
    fsm: FreeSpaceManager,
    registry: Registry,
    batcher: Batcher,
    stripes: Vec<RwLock<()>>,
    durable: Mutex<DurableState>,
    pool: BufferPool,
    status: AtomicU8,
    failure: Mutex<Option<String>>,
    counters: Counters,
    #[cfg(test)]
    hooks: TestHooks,
}

/// The storage engine handle.
///
/// Thread-safe, cheap to clone, every clone shares the same state.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens the vault file at `path`, creating it when missing or empty.
    ///
    /// An existing file is recovered: its log is replayed and checkpointed
    /// before the engine is returned.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            Self::create(path, file, config)
        } else {
            Self::recover(path, file, config)
        }
    }

    fn create(path: &Path, file: File, config: EngineConfig) -> Result<Self, EngineError> {
        let page_size = config.page_size;
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(EngineError::InvalidArgument(format!(
                "page size {page_size} must be a power of two >= {MIN_PAGE_SIZE}"
            )));
        }

        let log_pages = pages_for(config.log_region_size, page_size);
        let header = FileHeader {
            page_size,
            generation: 0,
            total_pages: 1 + log_pages,
            dir_offset: 0,
            dir_len: 0,
            map_offset: 0,
            map_len: 0,
            log_offset: page_size,
            log_len: log_pages * page_size,
            checkpoint_seq: 0,
        };

        file.set_len(header.total_pages * page_size)?;
        file.write_all_at(&header.to_slot()?, header.slot_offset())?;
        file.sync_all()?;

        let fsm = Self::fresh_fsm(&header, &config)?;
        let restored = Restored {
            fsm,
            registry: Registry::new(),
            log_tail: 0,
            last_seq: 0,
        };
        let engine = Self::assemble(path, file, config, header, restored)?;
        engine.checkpoint()?;

        info!(path = %path.display(), page_size, log_pages, "vault created");
        Ok(engine)
    }

    /// FSM of a file that was never checkpointed: header page and log in
    /// use, everything else free.
    fn fresh_fsm(header: &FileHeader, config: &EngineConfig) -> Result<FreeSpaceManager, EngineError> {
        let fsm = FreeSpaceManager::new(
            header.page_size,
            header.total_pages,
            config.initial_extension_pages,
            config.growth_factor,
        );
        fsm.reserve(Extent::new(0, 1))?;
        fsm.reserve(Extent::from_bytes(
            header.log_offset,
            header.log_len,
            header.page_size,
        ))?;
        Ok(fsm)
    }

    fn recover(path: &Path, file: File, mut config: EngineConfig) -> Result<Self, EngineError> {
        let mut page0 = vec![0u8; 2 * SLOT_SIZE];
        file.read_exact_at(&mut page0, 0).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                EngineError::InvalidHeader("file shorter than header page".into())
            }
            _ => EngineError::Io(e),
        })?;
        let header = FileHeader::select(&page0)?;

        let page_size = header.page_size;
        if page_size != config.page_size {
            warn!(
                stored = page_size,
                configured = config.page_size,
                "using page size stored in the file"
            );
            config.page_size = page_size;
        }
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(EngineError::InvalidHeader(format!("bad page size {page_size}")));
        }
        let file_len = file.metadata()?.len();
        if file_len < header.total_pages.saturating_mul(page_size) {
            return Err(EngineError::Inconsistent(format!(
                "file is {file_len} bytes, header expects {} pages",
                header.total_pages
            )));
        }

        let (fsm, registry) = if header.map_len == 0 {
            (Self::fresh_fsm(&header, &config)?, Registry::new())
        } else {
            let map = read_region(&file, header.map_offset, header.map_len)?;
            let snapshot = FreeMapSnapshot::unseal(&map)?;
            if snapshot.total_pages != header.total_pages {
                return Err(EngineError::Inconsistent(format!(
                    "free map covers {} pages, header says {}",
                    snapshot.total_pages, header.total_pages
                )));
            }
            let fsm = FreeSpaceManager::restore(
                page_size,
                &snapshot,
                config.initial_extension_pages,
                config.growth_factor,
            )?;
            let dir = read_region(&file, header.dir_offset, header.dir_len)?;
            (fsm, Registry::from_directory(&dir)?)
        };

        for entry in registry.entries()? {
            if !fsm.is_allocated(entry.extent(page_size))? {
                return Err(EngineError::Inconsistent(format!(
                    "block '{}' points at free pages",
                    entry.name
                )));
            }
        }

        let log_len = usize::try_from(header.log_len)
            .map_err(|_| EngineError::InvalidHeader("log region too large".into()))?;
        // SAFETY: the map is read-only and dropped before the engine exists;
        // nothing else writes the file while it is alive.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(header.log_offset)
                .len(log_len)
                .map(&file)?
        };
        let replay = wal::replay(&mmap, header.checkpoint_seq, log_len);
        drop(mmap);

        let blocks = registry.len()?;
        let restored = Restored {
            fsm,
            registry,
            log_tail: replay.tail,
            last_seq: replay.last_seq,
        };
        let engine = Self::assemble(path, file, config, header, restored)?;

        let groups = replay.groups.len() as u64;
        for group in replay.groups {
            trace!(commit_seq = group.commit_seq, records = group.records.len(), "re-applying group");
            for record in group.records {
                let op = match record.op {
                    LogOp::Put => PendingOp::Put(record.payload),
                    LogOp::Delete => PendingOp::Delete,
                    LogOp::Commit => continue,
                };
                engine.inner.replay_op(&record.name, &op)?;
            }
        }
        engine
            .inner
            .counters
            .recovered_groups
            .store(groups, Ordering::Relaxed);

        if groups > 0 {
            engine.checkpoint()?;
        }

        info!(
            path = %path.display(),
            blocks,
            replayed_groups = groups,
            discarded_records = replay.discarded,
            "vault opened"
        );
        Ok(engine)
    }

    fn assemble(
        path: &Path,
        file: File,
        config: EngineConfig,
        header: FileHeader,
        restored: Restored,
    ) -> Result<Self, EngineError> {
        let Restored {
            fsm,
            registry,
            log_tail,
            last_seq,
        } = restored;
        let log = LogRegion::new(header.log_offset, header.log_len, log_tail);
        let batcher = Batcher::new(config.flush_max_records, config.flush_max_bytes);
        let pool = BufferPool::new(8, 64 * 1024);

        Ok(Self {
            inner: Arc::new(EngineInner {
                path: path.to_path_buf(),
                file,
                page_size: header.page_size,
                config,
                fsm,
                registry,
                batcher,
                stripes: (0..utils::STRIPES).map(|_| RwLock::new(())).collect(),
                durable: Mutex::new(DurableState {
                    header,
                    log,
                    last_seq,
                }),
                pool,
                status: AtomicU8::new(STATUS_OPEN),
                failure: Mutex::new(None),
                counters: Counters::default(),
                #[cfg(test)]
                hooks: TestHooks::default(),
            }),
        })
    }

    /// Flushes buffered writes, checkpoints and marks the engine closed.
    ///
    /// An open batch is discarded. Calling `close` more than once is
    /// harmless.
    pub fn close(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        match inner.status.load(Ordering::Acquire) {
            STATUS_CLOSED => return Ok(()),
            STATUS_FAILED => {
                inner.status.store(STATUS_CLOSED, Ordering::Release);
                return Err(EngineError::Failed(inner.failure_reason()));
            }
            _ => {}
        }

        if inner.batcher.in_batch()? {
            let dropped = inner.batcher.cancel()?;
            warn!(dropped, "open batch discarded at close");
        }

        let mut durable = inner.lock_durable()?;
        let result = inner
            .flush_locked(&mut durable)
            .and_then(|_| inner.checkpoint_locked(&mut durable, 0));
        inner.guard(result)?;
        inner.file.sync_all()?;
        inner.status.store(STATUS_CLOSED, Ordering::Release);

        info!(path = %inner.path.display(), "vault closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Block operations
    // --------------------------------------------------------------------------------------------

    /// Reads the current contents of `name`.
    pub fn read(&self, name: &str, cancel: &CancelToken) -> Result<Vec<u8>, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        cancel.check()?;

        let _stripe = inner.stripe_read(name)?;
        match inner.batcher.lookup(name)? {
            Pending::Present(bytes) => return Ok(bytes),
            Pending::Deleted => return Err(EngineError::NotFound(name.to_string())),
            Pending::Unknown => {}
        }

        let entry = inner
            .registry
            .get(name)?
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        let len = usize::try_from(entry.length)
            .map_err(|_| EngineError::Inconsistent(format!("block '{name}' too large")))?;

        cancel.check()?;
        let mut buf = vec![0u8; len];
        inner.file.read_exact_at(&mut buf, entry.offset)?;
        entry.verify(&buf)?;

        trace!(name, len, "block read");
        Ok(buf)
    }

    /// Stages a write of `bytes` to `name`.
    ///
    /// Returns `Ok(true)` when the buffered writes reached a flush
    /// threshold (caller should arrange a flush), `Ok(false)` otherwise.
    pub fn write(&self, name: &str, bytes: Vec<u8>, cancel: &CancelToken) -> Result<bool, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        validate_name(name)?;
        if bytes.len() as u64 > inner.config.max_block_size {
            return Err(EngineError::InvalidArgument(format!(
                "block of {} bytes exceeds max_block_size ({})",
                bytes.len(),
                inner.config.max_block_size
            )));
        }
        cancel.check()?;

        let _stripe = inner.stripe_write(name)?;
        cancel.check()?;
        trace!(name, len = bytes.len(), "engine write");
        Ok(inner.batcher.stage(name.to_string(), PendingOp::Put(bytes))?)
    }

    /// Stages the removal of `name`.
    ///
    /// Returns [`EngineError::NotFound`] when the block does not exist,
    /// otherwise the same flush hint as [`Engine::write`].
    pub fn delete(&self, name: &str, cancel: &CancelToken) -> Result<bool, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        validate_name(name)?;
        cancel.check()?;

        let _stripe = inner.stripe_write(name)?;
        if !inner.visible(name)? {
            return Err(EngineError::NotFound(name.to_string()));
        }
        cancel.check()?;
        trace!(name, "engine delete");
        Ok(inner.batcher.stage(name.to_string(), PendingOp::Delete)?)
    }

    /// Returns `true` if `name` currently exists.
    pub fn contains(&self, name: &str) -> Result<bool, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        let _stripe = inner.stripe_read(name)?;
        inner.visible(name)
    }

    /// Names of existing blocks starting with `prefix`, ascending.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;

        // Buffered state first: a write applied between the two reads is
        // then still seen through the registry.
        let overlay = inner.batcher.overlay(prefix)?;
        let mut names: std::collections::BTreeSet<String> =
            inner.registry.names_with_prefix(prefix)?.into_iter().collect();
        for (name, present) in overlay {
            if present {
                names.insert(name);
            } else {
                names.remove(&name);
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Location of a block already applied to storage. Buffered writes
    /// have no location yet and yield `None`.
    pub fn stat(&self, name: &str) -> Result<Option<BlockStat>, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        if inner.batcher.lookup(name)? != Pending::Unknown {
            return Ok(None);
        }
        Ok(inner.registry.get(name)?.map(|entry| BlockStat {
            offset: entry.offset,
            length: entry.length,
            checksum: entry.checksum,
        }))
    }

    // --------------------------------------------------------------------------------------------
    // Batches
    // --------------------------------------------------------------------------------------------

    /// Opens a store-wide batch; see [`Batcher::begin`].
    pub fn begin_batch(&self) -> Result<(), EngineError> {
        self.inner.check_usable()?;
        Ok(self.inner.batcher.begin()?)
    }

    /// Closes the batch and flushes it as one commit group.
    pub fn end_batch(&self) -> Result<usize, EngineError> {
        self.inner.check_usable()?;
        let writes = self.inner.batcher.end()?;
        self.flush()?;
        Ok(writes)
    }

    /// Discards the open batch.
    pub fn cancel_batch(&self) -> Result<usize, EngineError> {
        self.inner.check_usable()?;
        Ok(self.inner.batcher.cancel()?)
    }

    /// `true` while a batch is open.
    pub fn in_batch(&self) -> Result<bool, EngineError> {
        Ok(self.inner.batcher.in_batch()?)
    }

    // --------------------------------------------------------------------------------------------
    // Flush / checkpoint
    // --------------------------------------------------------------------------------------------

    /// Makes every accumulated write durable and applies it.
    ///
    /// Returns `true` if anything was flushed.
    pub fn flush(&self) -> Result<bool, EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        let mut durable = inner.lock_durable()?;
        let result = inner.flush_locked(&mut durable);
        inner.guard(result)
    }

    /// Persists the directory and free map and resets the log.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        let mut durable = inner.lock_durable()?;
        let result = inner.checkpoint_locked(&mut durable, 0);
        inner.guard(result)
    }

    /// Timer-driven work: flushes an aged accumulating set and checkpoints
    /// when the registry crossed a threshold.
    pub fn maintenance(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.check_usable()?;
        let flush_due = inner.batcher.due_by_age(inner.config.flush_interval)?;
        let checkpoint_due = inner.checkpoint_due()?;
        if !flush_due && !checkpoint_due {
            return Ok(());
        }

        let mut durable = inner.lock_durable()?;
        let result = (|| -> Result<(), EngineError> {
            if flush_due {
                inner.flush_locked(&mut durable)?;
            }
            if inner.checkpoint_due()? {
                inner.checkpoint_locked(&mut durable, 0)?;
            }
            Ok(())
        })();
        inner.guard(result)
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = &self.inner;
        let durable = inner.lock_durable()?;
        Ok(EngineStats {
            blocks: inner.registry.len()?,
            generation: durable.header.generation,
            checkpoint_seq: durable.header.checkpoint_seq,
            last_seq: durable.last_seq,
            log_capacity: durable.log.capacity(),
            log_used: durable.log.tail(),
            dirty: inner.registry.dirty_count(),
            flushes: inner.counters.flushes.load(Ordering::Relaxed),
            checkpoints: inner.counters.checkpoints.load(Ordering::Relaxed),
            recovered_groups: inner.counters.recovered_groups.load(Ordering::Relaxed),
            fsm: inner.fsm.stats()?,
            batch: inner.batcher.stats()?,
        })
    }

    /// Page size of the open file.
    pub fn page_size(&self) -> u64 {
        self.inner.page_size
    }

    /// Stops the engine as if the process died: buffered writes are lost,
    /// nothing is flushed or checkpointed.
    #[cfg(test)]
    pub(crate) fn simulate_crash(&self) {
        self.inner.status.store(STATUS_CLOSED, Ordering::Release);
    }

    /// Makes the next flush fail before anything reaches the log.
    #[cfg(test)]
    pub(crate) fn inject_flush_failure(&self) {
        self.inner.hooks.fail_next_flush.store(true, Ordering::Release);
    }

    /// Makes the next checkpoint fail right before its header write, after
    /// the new directory and free map are on disk.
    #[cfg(test)]
    pub(crate) fn inject_header_failure(&self) {
        self.inner.hooks.fail_next_header.store(true, Ordering::Release);
    }

    /// Makes every file extension fail as if the disk were full.
    #[cfg(test)]
    pub(crate) fn refuse_growth(&self, refuse: bool) {
        self.inner.hooks.refuse_growth.store(refuse, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn check_fsm_invariants(&self) -> Result<(), String> {
        self.inner.fsm.check_invariants()
    }
}

// ------------------------------------------------------------------------------------------------
// EngineInner
// ------------------------------------------------------------------------------------------------

impl EngineInner {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn lock_durable(&self) -> Result<MutexGuard<'_, DurableState>, EngineError> {
        self.durable
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }

    fn stripe_read(&self, name: &str) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.stripes[utils::stripe_of(name)]
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn stripe_write(&self, name: &str) -> Result<RwLockWriteGuard<'_, ()>, EngineError> {
        self.stripes[utils::stripe_of(name)]
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Status
    // --------------------------------------------------------------------------------------------

    fn check_usable(&self) -> Result<(), EngineError> {
        match self.status.load(Ordering::Acquire) {
            STATUS_OPEN => Ok(()),
            STATUS_CLOSED => Err(EngineError::Closed),
            _ => Err(EngineError::Failed(self.failure_reason())),
        }
    }

    fn failure_reason(&self) -> String {
        match self.failure.lock() {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "Mutex poisoned".into(),
        }
    }

    /// Moves the engine into the failed state if `result` is an error.
    fn guard<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            error!("flush or checkpoint failed, engine stopped: {e}");
            if let Ok(mut reason) = self.failure.lock() {
                reason.get_or_insert_with(|| e.to_string());
            }
            let _ = self.status.compare_exchange(
                STATUS_OPEN,
                STATUS_FAILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        result
    }

    fn retry(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// `true` if `name` exists once buffered writes are taken into account.
    fn visible(&self, name: &str) -> Result<bool, EngineError> {
        Ok(match self.batcher.lookup(name)? {
            Pending::Present(_) => true,
            Pending::Deleted => false,
            Pending::Unknown => self.registry.contains(name)?,
        })
    }

    fn checkpoint_due(&self) -> Result<bool, EngineError> {
        Ok(self.registry.persist_due(
            self.config.checkpoint_dirty_threshold,
            self.config.checkpoint_interval,
        )?)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    fn flush_locked(&self, durable: &mut DurableState) -> Result<bool, EngineError> {
        let Some(set) = self.batcher.take_for_flush()? else {
            return Ok(false);
        };
        let committed = self.commit_set(durable, &set);
        self.batcher.finish_flush()?;
        committed?;

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        if self.checkpoint_due()? {
            self.checkpoint_locked(durable, 0)?;
        }
        Ok(true)
    }

    /// Logs `set` as one commit group, then applies it.
    ///
    /// Every put gets its extent before the group is logged, so running out
    /// of space fails the flush with nothing of it durable.
    fn commit_set(&self, durable: &mut DurableState, set: &WriteSet) -> Result<(), EngineError> {
        #[cfg(test)]
        if self.hooks.fail_next_flush.swap(false, Ordering::AcqRel) {
            return Err(EngineError::Io(io::Error::other("injected flush failure")));
        }

        let needed = set.log_bytes() + framed_len(0, 0);
        if needed > durable.log.remaining() {
            debug!(
                needed,
                remaining = durable.log.remaining(),
                "log region full; checkpointing before flush"
            );
            self.checkpoint_locked(durable, needed)?;
        }

        let placed = self.place_all(set)?;
        let (first_seq, commit_seq) = match self.log_set(durable, set) {
            Ok(seqs) => seqs,
            Err(e) => {
                self.release(&placed);
                return Err(e);
            }
        };

        for (write, extent) in set.writes().iter().zip(&placed) {
            match (&write.op, extent) {
                (PendingOp::Put(payload), Some(extent)) => {
                    self.apply_put(&write.name, payload, *extent)?
                }
                (PendingOp::Delete, _) => self.apply_delete(&write.name)?,
                (PendingOp::Put(_), None) => {
                    return Err(EngineError::Internal(format!("no extent for '{}'", write.name)));
                }
            }
        }

        debug!(
            first_seq,
            commit_seq,
            writes = set.len(),
            log_used = durable.log.tail(),
            "batch committed"
        );
        Ok(())
    }

    /// Allocates one extent per put of `set`, in staging order. On failure
    /// nothing stays allocated.
    fn place_all(&self, set: &WriteSet) -> Result<Vec<Option<Extent>>, EngineError> {
        let backing = self.backing();
        let mut placed = Vec::with_capacity(set.len());
        for write in set.writes() {
            let PendingOp::Put(payload) = &write.op else {
                placed.push(None);
                continue;
            };
            match self.fsm.allocate(payload.len() as u64, &backing) {
                Ok(extent) => placed.push(Some(extent)),
                Err(e) => {
                    warn!(name = %write.name, "no room for flush: {e}");
                    self.release(&placed);
                    return Err(e.into());
                }
            }
        }
        Ok(placed)
    }

    fn release(&self, placed: &[Option<Extent>]) {
        for extent in placed.iter().flatten() {
            if let Err(e) = self.fsm.free(*extent) {
                warn!("could not release {extent:?}: {e}");
            }
        }
    }

    /// Frames `set` plus its commit record and appends them with one sync.
    /// Returns the first and the commit sequence id.
    fn log_set(&self, durable: &mut DurableState, set: &WriteSet) -> Result<(u64, u64), EngineError> {
        let first_seq = durable.last_seq + 1;
        let mut seq = first_seq;
        let mut frames = self.pool.take();
        let framed = (|| -> Result<(), WalError> {
            for write in set.writes() {
                match &write.op {
                    PendingOp::Put(payload) => {
                        frame_op(seq, LogOp::Put, &write.name, payload, &mut frames)?
                    }
                    PendingOp::Delete => {
                        frame_op(seq, LogOp::Delete, &write.name, &[], &mut frames)?
                    }
                }
                seq += 1;
            }
            frame_op(seq, LogOp::Commit, "", &[], &mut frames)
        })();
        let appended = framed.and_then(|_| durable.log.append(&self.file, &frames, self.retry()));
        self.pool.give_back(frames);
        appended?;
        durable.last_seq = seq;
        Ok((first_seq, seq))
    }

    /// Re-applies one logged mutation during recovery.
    fn replay_op(&self, name: &str, op: &PendingOp) -> Result<(), EngineError> {
        match op {
            PendingOp::Put(payload) => {
                let extent = self.fsm.allocate(payload.len() as u64, &self.backing())?;
                self.apply_put(name, payload, extent)
            }
            PendingOp::Delete => self.apply_delete(name),
        }
    }

    /// Writes `payload` into `extent` and points `name` at it.
    fn apply_put(&self, name: &str, payload: &[u8], extent: Extent) -> Result<(), EngineError> {
        let page_size = self.page_size;
        let entry = BlockEntry::for_payload(name, extent.byte_offset(page_size), payload);
        self.retry()
            .run("block write", || self.file.write_all_at(payload, entry.offset))?;

        let _stripe = self.stripe_write(name)?;
        if let Some(old) = self.registry.put(entry)? {
            self.fsm.free(old.extent(page_size))?;
        }
        Ok(())
    }

    fn apply_delete(&self, name: &str) -> Result<(), EngineError> {
        let _stripe = self.stripe_write(name)?;
        if let Some(old) = self.registry.remove(name)? {
            self.fsm.free(old.extent(self.page_size))?;
        }
        Ok(())
    }

    fn backing(&self) -> FileBacking<'_> {
        FileBacking {
            file: &self.file,
            #[cfg(test)]
            refuse_growth: self.hooks.refuse_growth.load(Ordering::Acquire),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoint
    // --------------------------------------------------------------------------------------------

    /// Writes a new directory / free map pair and switches the header.
    ///
    /// Extents the current header points at (directory, free map, log)
    /// stay allocated until the new header is synced; the persisted map
    /// already lists them as free. A crash at any step leaves the previous
    /// checkpoint and its log readable.
    ///
    /// `log_needed` is the size of a commit group waiting to be logged; a
    /// log region smaller than that is moved to a larger extent.
    fn checkpoint_locked(&self, durable: &mut DurableState, log_needed: u64) -> Result<(), EngineError> {
        let page_size = self.page_size;
        let backing = self.backing();
        let old = durable.header.clone();
        let generation = old.generation + 1;
        let mut retired = Vec::with_capacity(3);

        let mut dir = self.pool.take();
        let covered = self.registry.seal_directory(&mut dir)?;
        let dir_extent = self.fsm.allocate(dir.len() as u64, &backing)?;
        if old.dir_len > 0 {
            retired.push(Extent::from_bytes(old.dir_offset, old.dir_len, page_size));
        }

        let mut log = LogRegion::new(old.log_offset, old.log_len, 0);
        if log_needed > old.log_len {
            let extent = self
                .fsm
                .allocate(log_needed.max(old.log_len.saturating_mul(2)), &backing)?;
            retired.push(Extent::from_bytes(old.log_offset, old.log_len, page_size));
            log = LogRegion::new(extent.byte_offset(page_size), extent.byte_len(page_size), 0);
            info!(
                old_len = old.log_len,
                new_len = log.capacity(),
                "log region relocated"
            );
        }

        let map_extent = self.allocate_map_extent(&backing)?;
        if old.map_len > 0 {
            retired.push(Extent::from_bytes(old.map_offset, old.map_len, page_size));
        }

        let mut snapshot = self.fsm.snapshot()?;
        for extent in &retired {
            snapshot.release(*extent);
        }
        let mut map = self.pool.take();
        snapshot.seal_into(&mut map)?;

        let retry = self.retry();
        retry.run("data sync", || self.file.sync_data())?;
        retry.run("directory write", || {
            self.file.write_all_at(&dir, dir_extent.byte_offset(page_size))
        })?;
        retry.run("free map write", || {
            self.file.write_all_at(&map, map_extent.byte_offset(page_size))
        })?;
        retry.run("metadata sync", || self.file.sync_data())?;

        #[cfg(test)]
        if self.hooks.fail_next_header.swap(false, Ordering::AcqRel) {
            return Err(EngineError::Io(io::Error::other("injected header failure")));
        }

        let header = FileHeader {
            page_size,
            generation,
            total_pages: snapshot.total_pages,
            dir_offset: dir_extent.byte_offset(page_size),
            dir_len: dir.len() as u64,
            map_offset: map_extent.byte_offset(page_size),
            map_len: map.len() as u64,
            log_offset: log.offset(),
            log_len: log.capacity(),
            checkpoint_seq: durable.last_seq,
        };
        let slot = header.to_slot()?;
        retry.run("header write", || self.file.write_all_at(&slot, header.slot_offset()))?;
        retry.run("header sync", || self.file.sync_data())?;

        for extent in retired {
            self.fsm.free(extent)?;
        }
        self.pool.give_back(dir);
        self.pool.give_back(map);
        self.registry.mark_persisted(covered)?;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);

        info!(
            generation,
            checkpoint_seq = header.checkpoint_seq,
            total_pages = header.total_pages,
            "checkpoint complete"
        );
        durable.header = header;
        durable.log = log;
        Ok(())
    }

    /// Allocates an extent large enough for the free map, including the
    /// pages the allocation itself may add to the file.
    fn allocate_map_extent(&self, backing: &FileBacking<'_>) -> Result<Extent, EngineError> {
        loop {
            let total = self.fsm.total_pages()?;
            let extent = self
                .fsm
                .allocate(FreeMapSnapshot::sealed_len(total), backing)?;
            let total_after = self.fsm.total_pages()?;
            if FreeMapSnapshot::sealed_len(total_after) <= extent.byte_len(self.page_size) {
                return Ok(extent);
            }
            self.fsm.free(extent)?;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidArgument("block name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "block name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

fn read_region(file: &File, offset: u64, len: u64) -> Result<Vec<u8>, EngineError> {
    let len = usize::try_from(len)
        .map_err(|_| EngineError::InvalidHeader("metadata region too large".into()))?;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}
