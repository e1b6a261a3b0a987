//! # Table Module
//!
//! Rows stored as vault blocks plus the indexes that point at them.
//!
//! A table named `t` keeps row `42` in the block `"t:00000000000000000042"`;
//! the fixed-width id keeps block names in row order. Row contents are
//! opaque bytes: an index is declared with an *extractor* that turns a row
//! into its key (or `None` to leave the row out of that index).
//!
//! ## Index maintenance
//!
//! Outside a batch, every insert, update and delete adjusts each index
//! directly. Inside a batch ([`Table::begin_batch`]) rows are written but
//! indexes are only marked dirty; [`Table::end_batch`] flushes the batch
//! and rebuilds each dirty index once from the stored rows, and
//! [`Table::cancel_batch`] drops the writes and the dirty marks without
//! touching any index. Index queries made during a batch see the state
//! from before it.
//!
//! Indexes live in memory only and are rebuilt from the rows when they
//! are created, so a reopened table gets them back by declaring them
//! again.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::index::{HashIndex, IndexError, IndexKey, OrderedIndex, RangeCursor, RowId};
use crate::{Vault, VaultError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Table`] operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Error from the underlying vault.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// Error from an index.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Table or index name not usable.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// An index with this name already exists.
    #[error("index '{0}' already exists")]
    DuplicateIndex(String),

    /// No index with this name.
    #[error("unknown index '{0}'")]
    UnknownIndex(String),

    /// Range scan requested on a hash index.
    #[error("index '{0}' is not ordered")]
    NotOrdered(String),

    /// No row with this id.
    #[error("row {0} not found")]
    RowNotFound(RowId),

    /// Internal invariant violation (poisoned lock, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Index handles
// ------------------------------------------------------------------------------------------------

/// Maps a row to its index key; `None` keeps the row out of the index.
pub type Extractor = Arc<dyn Fn(&[u8]) -> Option<IndexKey> + Send + Sync>;

enum IndexKind {
    Ordered(OrderedIndex<IndexKey>),
    Hash(HashIndex<IndexKey>),
}

struct TableIndex {
    kind: IndexKind,
    extractor: Extractor,
}

impl TableIndex {
    fn insert(&self, key: IndexKey, row: RowId) -> Result<bool, IndexError> {
        match &self.kind {
            IndexKind::Ordered(index) => index.insert(key, row),
            IndexKind::Hash(index) => index.insert(key, row),
        }
    }

    fn remove(&self, key: &IndexKey, row: RowId) -> Result<bool, IndexError> {
        match &self.kind {
            IndexKind::Ordered(index) => index.remove(key, row),
            IndexKind::Hash(index) => index.remove(key, row),
        }
    }

    fn lookup(&self, key: &IndexKey) -> Result<Vec<RowId>, IndexError> {
        match &self.kind {
            IndexKind::Ordered(index) => index.lookup(key),
            IndexKind::Hash(index) => index.lookup(key),
        }
    }

    fn rebuild(&self, rows: &[(RowId, Vec<u8>)]) -> Result<(), IndexError> {
        let entries = rows
            .iter()
            .filter_map(|(row, bytes)| (self.extractor)(bytes).map(|key| (key, *row)));
        match &self.kind {
            IndexKind::Ordered(index) => index.rebuild(entries),
            IndexKind::Hash(index) => index.rebuild(entries),
        }
    }

    fn len(&self) -> Result<usize, IndexError> {
        match &self.kind {
            IndexKind::Ordered(index) => index.len(),
            IndexKind::Hash(index) => index.len(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// A named set of rows in a [`Vault`] with its secondary indexes.
pub struct Table {
    vault: Arc<Vault>,
    name: String,
    prefix: String,
    next_row: AtomicU64,
    indexes: RwLock<BTreeMap<String, Arc<TableIndex>>>,
    /// Dirty index names while a table batch is open.
    batch: Mutex<Option<BTreeSet<String>>>,
    /// Serializes row mutations so a row and its index entries change together.
    writer: Mutex<()>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("next_row", &self.next_row.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Opens table `name`, picking up the rows already stored in `vault`.
    pub fn open(vault: Arc<Vault>, name: &str) -> Result<Self, TableError> {
        if name.is_empty() || name.contains(':') {
            return Err(TableError::InvalidName(format!(
                "table name '{name}' must be non-empty and free of ':'"
            )));
        }
        let prefix = format!("{name}:");

        let mut last = None;
        let mut rows = 0usize;
        for block in vault.list(&prefix)? {
            match parse_row(&prefix, &block) {
                Some(row) => {
                    last = last.max(Some(row));
                    rows += 1;
                }
                None => warn!(table = name, block = %block, "ignoring block with foreign name"),
            }
        }
        let next_row = last.map_or(0, |row| row + 1);

        info!(table = name, rows, next_row, "table opened");
        Ok(Self {
            vault,
            name: name.to_string(),
            prefix,
            next_row: AtomicU64::new(next_row),
            indexes: RwLock::new(BTreeMap::new()),
            batch: Mutex::new(None),
            writer: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, TableError> {
        self.writer
            .lock()
            .map_err(|_| TableError::Internal("Mutex poisoned".into()))
    }

    fn lock_batch(&self) -> Result<MutexGuard<'_, Option<BTreeSet<String>>>, TableError> {
        self.batch
            .lock()
            .map_err(|_| TableError::Internal("Mutex poisoned".into()))
    }

    /// Fails when the vault batch was opened by someone else: rows written
    /// now would join it while this table's indexes move on without it.
    fn check_batch_owner(&self) -> Result<(), TableError> {
        if self.lock_batch()?.is_none() && self.vault.in_batch()? {
            return Err(VaultError::BatchState(format!(
                "a batch not owned by table '{}' is open",
                self.name
            ))
            .into());
        }
        Ok(())
    }

    fn index_list(&self) -> Result<Vec<(String, Arc<TableIndex>)>, TableError> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| TableError::Internal("RwLock poisoned".into()))?;
        Ok(indexes
            .iter()
            .map(|(name, index)| (name.clone(), Arc::clone(index)))
            .collect())
    }

    fn index(&self, name: &str) -> Result<Arc<TableIndex>, TableError> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| TableError::Internal("RwLock poisoned".into()))?;
        indexes
            .get(name)
            .cloned()
            .ok_or_else(|| TableError::UnknownIndex(name.to_string()))
    }

    // --------------------------------------------------------------------------------------------
    // Indexes
    // --------------------------------------------------------------------------------------------

    /// Declares an ordered index and builds it from the current rows.
    pub fn create_ordered_index<F>(&self, name: &str, extractor: F) -> Result<(), TableError>
    where
        F: Fn(&[u8]) -> Option<IndexKey> + Send + Sync + 'static,
    {
        self.create_index(name, IndexKind::Ordered(OrderedIndex::new()), Arc::new(extractor))
    }

    /// Declares a hash index and builds it from the current rows.
    pub fn create_hash_index<F>(&self, name: &str, extractor: F) -> Result<(), TableError>
    where
        F: Fn(&[u8]) -> Option<IndexKey> + Send + Sync + 'static,
    {
        self.create_index(name, IndexKind::Hash(HashIndex::new()), Arc::new(extractor))
    }

    fn create_index(&self, name: &str, kind: IndexKind, extractor: Extractor) -> Result<(), TableError> {
        if name.is_empty() {
            return Err(TableError::InvalidName("index name must not be empty".into()));
        }
        let _writer = self.lock_writer()?;
        if self.lock_batch()?.is_some() {
            return Err(VaultError::BatchState("cannot create an index inside a batch".into()).into());
        }

        let index = TableIndex { kind, extractor };
        index.rebuild(&self.scan_rows()?)?;
        let entries = index.len()?;

        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| TableError::Internal("RwLock poisoned".into()))?;
        if indexes.contains_key(name) {
            return Err(TableError::DuplicateIndex(name.to_string()));
        }
        indexes.insert(name.to_string(), Arc::new(index));

        info!(table = %self.name, index = name, entries, "index created");
        Ok(())
    }

    /// Removes an index. Returns `false` if it did not exist.
    pub fn drop_index(&self, name: &str) -> Result<bool, TableError> {
        let _writer = self.lock_writer()?;
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| TableError::Internal("RwLock poisoned".into()))?;
        let removed = indexes.remove(name).is_some();
        if let Some(dirty) = self.lock_batch()?.as_mut() {
            dirty.remove(name);
        }
        Ok(removed)
    }

    /// Names of the declared indexes, ascending.
    pub fn index_names(&self) -> Result<Vec<String>, TableError> {
        Ok(self.index_list()?.into_iter().map(|(name, _)| name).collect())
    }

    // --------------------------------------------------------------------------------------------
    // Rows
    // --------------------------------------------------------------------------------------------

    fn row_name(&self, row: RowId) -> String {
        format!("{}{row:020}", self.prefix)
    }

    /// Stores a new row and returns its id.
    pub fn insert_row(&self, bytes: &[u8]) -> Result<RowId, TableError> {
        let _writer = self.lock_writer()?;
        self.check_batch_owner()?;
        let row = self.next_row.fetch_add(1, Ordering::AcqRel);
        self.vault.write(&self.row_name(row), bytes)?;
        self.index_change(row, None, Some(bytes))?;
        debug!(table = %self.name, row, len = bytes.len(), "row inserted");
        Ok(row)
    }

    /// Replaces the contents of an existing row.
    pub fn update_row(&self, row: RowId, bytes: &[u8]) -> Result<(), TableError> {
        let _writer = self.lock_writer()?;
        self.check_batch_owner()?;
        let old = self.read_row(row)?.ok_or(TableError::RowNotFound(row))?;
        self.vault.write(&self.row_name(row), bytes)?;
        self.index_change(row, Some(&old), Some(bytes))?;
        debug!(table = %self.name, row, len = bytes.len(), "row updated");
        Ok(())
    }

    /// Removes a row.
    pub fn delete_row(&self, row: RowId) -> Result<(), TableError> {
        let _writer = self.lock_writer()?;
        self.check_batch_owner()?;
        let old = self.read_row(row)?.ok_or(TableError::RowNotFound(row))?;
        self.vault.delete(&self.row_name(row))?;
        self.index_change(row, Some(&old), None)?;
        debug!(table = %self.name, row, "row deleted");
        Ok(())
    }

    /// Contents of a row, `None` if it does not exist.
    pub fn get_row(&self, row: RowId) -> Result<Option<Vec<u8>>, TableError> {
        self.read_row(row)
    }

    fn read_row(&self, row: RowId) -> Result<Option<Vec<u8>>, TableError> {
        match self.vault.read(&self.row_name(row)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(VaultError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all rows, ascending.
    pub fn row_ids(&self) -> Result<Vec<RowId>, TableError> {
        Ok(self
            .vault
            .list(&self.prefix)?
            .iter()
            .filter_map(|block| parse_row(&self.prefix, block))
            .collect())
    }

    fn scan_rows(&self) -> Result<Vec<(RowId, Vec<u8>)>, TableError> {
        let mut rows = Vec::new();
        for row in self.row_ids()? {
            // a row deleted between list and read is simply skipped
            if let Some(bytes) = self.read_row(row)? {
                rows.push((row, bytes));
            }
        }
        Ok(rows)
    }

    /// Applies a row change to every index, or marks them dirty inside a
    /// batch.
    fn index_change(&self, row: RowId, old: Option<&[u8]>, new: Option<&[u8]>) -> Result<(), TableError> {
        let indexes = self.index_list()?;
        if let Some(dirty) = self.lock_batch()?.as_mut() {
            dirty.extend(indexes.into_iter().map(|(name, _)| name));
            return Ok(());
        }

        for (name, index) in indexes {
            let old_key = old.and_then(|bytes| (index.extractor)(bytes));
            let new_key = new.and_then(|bytes| (index.extractor)(bytes));
            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                if !index.remove(&key, row)? {
                    warn!(table = %self.name, index = %name, row, %key, "index entry was missing");
                }
            }
            if let Some(key) = new_key {
                index.insert(key, row)?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Rows whose key in `index` equals `key`, ascending.
    pub fn lookup(&self, index: &str, key: &IndexKey) -> Result<Vec<RowId>, TableError> {
        Ok(self.index(index)?.lookup(key)?)
    }

    /// Lazy scan of `start <= key <= end` over an ordered index.
    pub fn range(&self, index: &str, start: IndexKey, end: IndexKey) -> Result<RangeCursor<IndexKey>, TableError> {
        match &self.index(index)?.kind {
            IndexKind::Ordered(ordered) => Ok(ordered.range(start, end)),
            IndexKind::Hash(_) => Err(TableError::NotOrdered(index.to_string())),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Batches
    // --------------------------------------------------------------------------------------------

    /// Opens a vault batch and defers index maintenance until it ends.
    pub fn begin_batch(&self) -> Result<(), TableError> {
        let _writer = self.lock_writer()?;
        let mut batch = self.lock_batch()?;
        if batch.is_some() {
            return Err(VaultError::BatchState("table batch already active".into()).into());
        }
        self.vault.begin_batch()?;
        *batch = Some(BTreeSet::new());
        Ok(())
    }

    /// Commits the batch and rebuilds every index it touched, once.
    /// Returns the number of writes committed.
    pub fn end_batch(&self) -> Result<usize, TableError> {
        let _writer = self.lock_writer()?;
        let dirty = self
            .lock_batch()?
            .take()
            .ok_or_else(|| VaultError::BatchState("no table batch active".into()))?;
        let writes = self.vault.end_batch()?;

        if !dirty.is_empty() {
            let rows = self.scan_rows()?;
            for name in &dirty {
                // dropped while the batch was open
                let Ok(index) = self.index(name) else { continue };
                index.rebuild(&rows)?;
            }
            debug!(table = %self.name, indexes = dirty.len(), rows = rows.len(), "dirty indexes rebuilt");
        }
        Ok(writes)
    }

    /// Discards the batch; indexes are left as they were before it.
    /// Returns the number of writes dropped.
    pub fn cancel_batch(&self) -> Result<usize, TableError> {
        let _writer = self.lock_writer()?;
        self.lock_batch()?
            .take()
            .ok_or_else(|| VaultError::BatchState("no table batch active".into()))?;
        Ok(self.vault.cancel_batch()?)
    }
}

/// Row id encoded in a block name, `None` for names of another shape.
fn parse_row(prefix: &str, block: &str) -> Option<RowId> {
    let digits = block.strip_prefix(prefix)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
