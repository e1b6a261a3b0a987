//! # BlockVault
//!
//! An embeddable, single-file block storage engine. Named, variable-length
//! byte blocks are stored in one backing file together with everything
//! needed to find and verify them again: a free-space manager, a block
//! registry with SHA-256 checksums, a write-ahead log region and two
//! header slots that switch atomically at every checkpoint.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockvault::{Vault, VaultConfig};
//!
//! let vault = Vault::open("/tmp/my.vault", VaultConfig::default()).unwrap();
//!
//! // Write (buffered, made durable by the next flush)
//! vault.write("row:1", b"hello").unwrap();
//! vault.flush().unwrap();
//!
//! // Read
//! assert_eq!(vault.read("row:1").unwrap(), b"hello");
//!
//! // All-or-nothing group of writes
//! vault.begin_batch().unwrap();
//! vault.write("row:2", b"a").unwrap();
//! vault.write("row:3", b"b").unwrap();
//! vault.end_batch().unwrap();
//!
//! // Graceful shutdown
//! vault.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Batched durability**: writes are grouped, logged with one sync and
//!   applied; a crash loses at most the group not yet logged.
//! - **Replace, never mutate**: an update writes a new extent, so recovery
//!   is a plain redo of the log.
//! - **Integrity**: every block carries a SHA-256 checksum verified on read;
//!   header, directory, free map and log records are CRC32-framed.
//! - **Indexes**: [`OrderedIndex`] and [`HashIndex`], maintained per row or
//!   rebuilt in one pass at batch end by the [`Table`] layer.

pub(crate) mod batch;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod fsm;
pub mod index;
pub(crate) mod registry;
pub mod table;
pub(crate) mod wal;

use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use engine::{Engine, EngineConfig, EngineError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use batch::{BatchPhase, BatchStats};
pub use engine::{BlockStat, CancelToken, EngineStats as VaultStats};
pub use fsm::FsmStats;
pub use index::{HashIndex, IndexError, IndexKey, OrderedIndex, RangeCursor, RowId};
pub use table::{Table, TableError};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Vault`] instance.
///
/// All fields have defaults via [`VaultConfig::default()`]. The
/// configuration is validated when passed to [`Vault::open`].
///
/// # Example
///
/// ```rust
/// use blockvault::VaultConfig;
/// use std::time::Duration;
///
/// let config = VaultConfig {
///     flush_interval: Duration::from_millis(10),
///     background_flush: false,
///     ..VaultConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Allocation unit. Only used when the file is created; an existing
    /// file keeps its own page size.
    ///
    /// Default: 4096. Must be a power of two in `512..=65536`.
    pub page_size: u64,

    /// Pages added by the first file extension.
    ///
    /// Default: 256. Must be ≥ 1.
    pub initial_extension_pages: u64,

    /// Each extension is this many times the previous one.
    ///
    /// Default: 2. Must be ≥ 2.
    pub growth_factor: u64,

    /// Bytes reserved for the log region at creation. The region is moved
    /// to a larger extent when a single commit group does not fit.
    ///
    /// Default: 4 MiB. Must be at least four pages.
    pub log_region_size: u64,

    /// Largest accepted block.
    ///
    /// Default: 64 MiB. Must be in `1..=u32::MAX`.
    pub max_block_size: u64,

    /// Buffered writes that make a flush due.
    ///
    /// Default: 1024. Must be ≥ 1.
    pub flush_max_records: usize,

    /// Buffered log bytes that make a flush due.
    ///
    /// Default: 4 MiB. Must be ≥ 1.
    pub flush_max_bytes: u64,

    /// Age of the oldest buffered write that makes a flush due.
    ///
    /// Default: 50 ms. Must be > 0.
    pub flush_interval: Duration,

    /// Applied mutations since the last checkpoint that make one due.
    ///
    /// Default: 4096. Must be ≥ 1.
    pub checkpoint_dirty_threshold: u64,

    /// Time since the last checkpoint that makes one due (if anything
    /// changed).
    ///
    /// Default: 1 s. Must be > 0.
    pub checkpoint_interval: Duration,

    /// Retries of transient I/O errors during flush and checkpoint.
    ///
    /// Default: 3.
    pub flush_retries: u32,

    /// Initial delay between retries; doubles after each attempt.
    ///
    /// Default: 5 ms.
    pub retry_backoff: Duration,

    /// Runs a background thread for timer-driven flushes and checkpoints.
    /// When disabled, a write that makes a flush due flushes inline.
    ///
    /// Default: `true`.
    pub background_flush: bool,
}

impl Default for VaultConfig {
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
            flush_retries: 3,
            retry_backoff: Duration::from_millis(5),
            background_flush: true,
        }
    }
}

impl VaultConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), VaultError> {
        if !self.page_size.is_power_of_two() || !(512..=65536).contains(&self.page_size) {
            return Err(VaultError::InvalidConfig(
                "page_size must be a power of two in 512..=65536".into(),
            ));
        }
        if self.initial_extension_pages < 1 {
            return Err(VaultError::InvalidConfig(
                "initial_extension_pages must be >= 1".into(),
            ));
        }
        if self.growth_factor < 2 {
            return Err(VaultError::InvalidConfig("growth_factor must be >= 2".into()));
        }
        if self.log_region_size < 4 * self.page_size {
            return Err(VaultError::InvalidConfig(
                "log_region_size must be at least 4 pages".into(),
            ));
        }
        if self.max_block_size < 1 || self.max_block_size > u64::from(u32::MAX) {
            return Err(VaultError::InvalidConfig(
                "max_block_size must be in 1..=u32::MAX".into(),
            ));
        }
        if self.flush_max_records < 1 || self.flush_max_bytes < 1 {
            return Err(VaultError::InvalidConfig(
                "flush_max_records and flush_max_bytes must be >= 1".into(),
            ));
        }
        if self.flush_interval.is_zero() || self.checkpoint_interval.is_zero() {
            return Err(VaultError::InvalidConfig(
                "flush_interval and checkpoint_interval must be > 0".into(),
            ));
        }
        if self.checkpoint_dirty_threshold < 1 {
            return Err(VaultError::InvalidConfig(
                "checkpoint_dirty_threshold must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.page_size,
            initial_extension_pages: self.initial_extension_pages,
            growth_factor: self.growth_factor,
            log_region_size: self.log_region_size,
            max_block_size: self.max_block_size,
            flush_max_records: self.flush_max_records,
            flush_max_bytes: self.flush_max_bytes,
            flush_interval: self.flush_interval,
            checkpoint_dirty_threshold: self.checkpoint_dirty_threshold,
            checkpoint_interval: self.checkpoint_interval,
            retry: wal::RetryPolicy {
                retries: self.flush_retries,
                backoff: self.retry_backoff,
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Vault`] operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Stored bytes or metadata failed verification.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The backing file could not grow.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No block with this name.
    #[error("block '{0}' not found")]
    NotFound(String),

    /// Batch call out of order (begin twice, end without begin, ...).
    #[error("batch state: {0}")]
    BatchState(String),

    /// The operation's cancel token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The vault has been closed.
    #[error("vault is closed")]
    Closed,

    /// An earlier flush or checkpoint failed; reopen the vault.
    #[error("vault failed: {0}")]
    Failed(String),

    /// Caller-supplied value out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for VaultError {
    fn from(e: EngineError) -> Self {
        use fsm::FsmError;
        use registry::RegistryError;
        use wal::WalError;

        match e {
            EngineError::Registry(RegistryError::Corruption(name)) => {
                VaultError::Corruption(format!("block '{name}' checksum mismatch"))
            }
            EngineError::Registry(RegistryError::Internal(msg))
            | EngineError::Fsm(FsmError::Internal(msg))
            | EngineError::Wal(WalError::Internal(msg))
            | EngineError::Batch(batch::BatchError::Internal(msg))
            | EngineError::Internal(msg) => VaultError::Internal(msg),
            EngineError::Fsm(e @ FsmError::OutOfSpace { .. }) => VaultError::OutOfSpace(e.to_string()),
            EngineError::Wal(e @ WalError::RegionFull { .. }) => VaultError::OutOfSpace(e.to_string()),
            EngineError::Wal(WalError::Io(e)) | EngineError::Io(e) => VaultError::Io(e),
            EngineError::Wal(e @ WalError::RecordTooLarge(_)) => {
                VaultError::InvalidArgument(e.to_string())
            }
            EngineError::Batch(e) => VaultError::BatchState(e.to_string()),
            EngineError::NotFound(name) => VaultError::NotFound(name),
            EngineError::InvalidArgument(msg) => VaultError::InvalidArgument(msg),
            EngineError::Cancelled => VaultError::Cancelled,
            EngineError::Closed => VaultError::Closed,
            EngineError::Failed(reason) => VaultError::Failed(reason),
            e @ (EngineError::Registry(_)
            | EngineError::Fsm(_)
            | EngineError::Wal(_)
            | EngineError::Encoding(_)
            | EngineError::InvalidHeader(_)
            | EngineError::Inconsistent(_)) => VaultError::Corruption(e.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background flusher
// ------------------------------------------------------------------------------------------------

/// Timer thread plus its two control channels.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct Flusher {
    wake: Sender<()>,
    shutdown: Sender<()>,
    handle: thread::JoinHandle<()>,
}

enum Wake {
    Shutdown,
    Flush,
    Tick,
}

impl Flusher {
    fn spawn(engine: Engine, interval: Duration) -> Result<Self, VaultError> {
        let (wake, wake_rx) = channel::bounded::<()>(1);
        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);

        let handle = thread::Builder::new()
            .name("blockvault-flusher".into())
            .spawn(move || {
                loop {
                    let event = channel::select! {
                        recv(shutdown_rx) -> _ => Wake::Shutdown,
                        recv(wake_rx) -> msg => if msg.is_ok() { Wake::Flush } else { Wake::Shutdown },
                        recv(ticker) -> _ => Wake::Tick,
                    };
                    let result = match event {
                        Wake::Shutdown => break,
                        Wake::Flush => engine.flush().map(|_| ()),
                        Wake::Tick => engine.maintenance(),
                    };
                    match result {
                        Ok(()) => {}
                        Err(EngineError::Closed) => break,
                        Err(e) => {
                            error!("background flush failed: {e}");
                            break;
                        }
                    }
                }
                debug!("flusher stopped");
            })?;

        Ok(Self {
            wake,
            shutdown,
            handle,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Vault handle
// ------------------------------------------------------------------------------------------------

/// The main vault handle.
///
/// # Thread safety
///
/// `Vault` is `Send + Sync`; share it across threads via `Arc<Vault>`.
/// Reads of different blocks run in parallel, mutations of the same name
/// are serialized.
///
/// # Durability
///
/// [`Vault::write`] and [`Vault::delete`] only buffer the mutation. It
/// becomes durable once a flush logs it: when a size threshold is
/// reached, when the background thread finds it older than
/// `flush_interval`, on [`Vault::flush`], [`Vault::end_batch`] or
/// [`Vault::close`].
///
/// # Shutdown
///
/// Call [`Vault::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor attempts the same cleanup but
/// ignores errors.
pub struct Vault {
    engine: Engine,
    flusher: Mutex<Option<Flusher>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Opens (or creates) the vault file at `path`.
    ///
    /// An existing file is recovered first: the newest valid header is
    /// selected and the log written since its checkpoint is replayed.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidConfig`] if any configuration parameter
    /// is out of range, [`VaultError::Corruption`] if the file's metadata
    /// cannot be trusted.
    pub fn open(path: impl AsRef<Path>, config: VaultConfig) -> Result<Self, VaultError> {
        config.validate()?;
        let engine = Engine::open(&path, config.to_engine_config())?;

        let flusher = if config.background_flush {
            let interval = config.flush_interval.min(config.checkpoint_interval);
            match Flusher::spawn(engine.clone(), interval) {
                Ok(flusher) => Some(flusher),
                Err(e) => {
                    let _ = engine.close();
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            path = %path.as_ref().display(),
            background_flush = config.background_flush,
            "vault opened"
        );

        Ok(Self {
            engine,
            flusher: Mutex::new(flusher),
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the vault.
    ///
    /// Stops the background thread, flushes buffered writes, checkpoints
    /// and syncs the file. An open batch is discarded.
    ///
    /// Subsequent operations on this handle return [`VaultError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), VaultError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_flusher();
        self.engine.close()?;

        info!("vault closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Block operations
    // --------------------------------------------------------------------------------------------

    /// Reads the current contents of `name`, including buffered writes.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if the block does not exist,
    /// [`VaultError::Corruption`] if the stored bytes fail their checksum.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, VaultError> {
        self.read_with(name, &CancelToken::none())
    }

    /// [`Vault::read`] that gives up with [`VaultError::Cancelled`] once
    /// `cancel` fires.
    pub fn read_with(&self, name: &str, cancel: &CancelToken) -> Result<Vec<u8>, VaultError> {
        self.check_open()?;
        Ok(self.engine.read(name, cancel)?)
    }

    /// Stores `bytes` under `name`, replacing any previous block.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidArgument`] for an empty or oversized name, or
    /// a block larger than `max_block_size`.
    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<(), VaultError> {
        self.write_with(name, bytes, &CancelToken::none())
    }

    /// [`Vault::write`] with a cancel token.
    pub fn write_with(&self, name: &str, bytes: &[u8], cancel: &CancelToken) -> Result<(), VaultError> {
        self.check_open()?;
        if self.engine.write(name, bytes.to_vec(), cancel)? {
            self.schedule_flush()?;
        }
        Ok(())
    }

    /// Removes the block `name`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if the block does not exist.
    pub fn delete(&self, name: &str) -> Result<(), VaultError> {
        self.delete_with(name, &CancelToken::none())
    }

    /// [`Vault::delete`] with a cancel token.
    pub fn delete_with(&self, name: &str, cancel: &CancelToken) -> Result<(), VaultError> {
        self.check_open()?;
        if self.engine.delete(name, cancel)? {
            self.schedule_flush()?;
        }
        Ok(())
    }

    /// Returns `true` if `name` currently exists.
    pub fn contains(&self, name: &str) -> Result<bool, VaultError> {
        self.check_open()?;
        Ok(self.engine.contains(name)?)
    }

    /// Names of existing blocks starting with `prefix`, ascending.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        self.check_open()?;
        Ok(self.engine.list(prefix)?)
    }

    /// Physical location and checksum of an applied block. `None` while
    /// the latest write of `name` is still buffered, or if it does not
    /// exist.
    pub fn stat(&self, name: &str) -> Result<Option<BlockStat>, VaultError> {
        self.check_open()?;
        Ok(self.engine.stat(name)?)
    }

    // --------------------------------------------------------------------------------------------
    // Batches
    // --------------------------------------------------------------------------------------------

    /// Opens a batch. Writes until [`Vault::end_batch`] are visible to
    /// reads but are logged as one commit group: after a crash either all
    /// of them are recovered or none.
    ///
    /// Batches are vault-wide; a second `begin_batch` fails with
    /// [`VaultError::BatchState`].
    pub fn begin_batch(&self) -> Result<(), VaultError> {
        self.check_open()?;
        self.engine.begin_batch()?;
        debug!("batch started");
        Ok(())
    }

    /// Ends the batch and flushes it. Returns the number of distinct
    /// writes it held.
    pub fn end_batch(&self) -> Result<usize, VaultError> {
        self.check_open()?;
        Ok(self.engine.end_batch()?)
    }

    /// Discards the batch. Returns the number of writes dropped.
    pub fn cancel_batch(&self) -> Result<usize, VaultError> {
        self.check_open()?;
        Ok(self.engine.cancel_batch()?)
    }

    /// `true` while a batch is open.
    pub fn in_batch(&self) -> Result<bool, VaultError> {
        self.check_open()?;
        Ok(self.engine.in_batch()?)
    }

    // --------------------------------------------------------------------------------------------
    // Durability
    // --------------------------------------------------------------------------------------------

    /// Logs and applies every buffered write outside an open batch.
    /// Returns `true` if anything was flushed.
    pub fn flush(&self) -> Result<bool, VaultError> {
        self.check_open()?;
        Ok(self.engine.flush()?)
    }

    /// Persists directory and free map and resets the log.
    pub fn checkpoint(&self) -> Result<(), VaultError> {
        self.check_open()?;
        Ok(self.engine.checkpoint()?)
    }

    /// Snapshot of vault statistics.
    pub fn stats(&self) -> Result<VaultStats, VaultError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    /// Page size of the open file.
    pub fn page_size(&self) -> u64 {
        self.engine.page_size()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(VaultError::Closed)` if the vault has been closed.
    fn check_open(&self) -> Result<(), VaultError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VaultError::Closed);
        }
        Ok(())
    }

    fn lock_flusher(&self) -> Result<std::sync::MutexGuard<'_, Option<Flusher>>, VaultError> {
        self.flusher
            .lock()
            .map_err(|_| VaultError::Internal("Mutex poisoned".into()))
    }

    /// Hands a due flush to the background thread, or runs it inline when
    /// there is none.
    fn schedule_flush(&self) -> Result<(), VaultError> {
        let guard = self.lock_flusher()?;
        match guard.as_ref() {
            // a full channel means a wake-up is already pending
            Some(flusher) => {
                let _ = flusher.wake.try_send(());
            }
            None => {
                drop(guard);
                self.engine.flush()?;
            }
        }
        Ok(())
    }

    /// Signals the flusher to stop and joins it.
    fn stop_flusher(&self) {
        let flusher = match self.flusher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(flusher) = flusher {
            let _ = flusher.shutdown.send(());
            if flusher.handle.join().is_err() {
                warn!("flusher thread panicked");
            }
        }
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.stop_flusher();
            let _ = self.engine.close();
        }
    }
}
