//! Ordered index over `(key, row)` pairs.
//!
//! Entries live in a [`BTreeSet`] keyed by the pair, so duplicate keys are
//! ordered by row id and a given pair is stored once. Range scans return a
//! [`RangeCursor`] that pulls entries from the set in small chunks under a
//! short read lock and resumes after the last pair it yielded.

use std::{
    collections::{BTreeSet, VecDeque},
    ops::Bound,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, trace};

use super::{IndexError, RowId};

/// Entries fetched per lock acquisition while a cursor advances.
pub const CURSOR_CHUNK: usize = 64;

type Entries<K> = BTreeSet<(K, RowId)>;

/// Sorted multimap from key to row ids.
#[derive(Debug)]
pub struct OrderedIndex<K> {
    entries: Arc<RwLock<Entries<K>>>,
}

impl<K> Default for OrderedIndex<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }
}

impl<K: Ord + Clone> OrderedIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries<K>>, IndexError> {
        self.entries
            .read()
            .map_err(|_| IndexError::Internal("RwLock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries<K>>, IndexError> {
        self.entries
            .write()
            .map_err(|_| IndexError::Internal("RwLock poisoned".into()))
    }

    /// Adds `(key, row)`. Returns `false` if the pair was already present.
    pub fn insert(&self, key: K, row: RowId) -> Result<bool, IndexError> {
        Ok(self.write()?.insert((key, row)))
    }

    /// Removes `(key, row)`. Returns `false` if the pair was absent.
    pub fn remove(&self, key: &K, row: RowId) -> Result<bool, IndexError> {
        Ok(self.write()?.remove(&(key.clone(), row)))
    }

    /// Rows stored under `key`, ascending.
    pub fn lookup(&self, key: &K) -> Result<Vec<RowId>, IndexError> {
        let entries = self.read()?;
        Ok(entries
            .range((key.clone(), RowId::MIN)..=(key.clone(), RowId::MAX))
            .map(|(_, row)| *row)
            .collect())
    }

    /// Lazy scan of every entry with `start <= key <= end`, in key order.
    ///
    /// An empty cursor is returned when `start > end`.
    pub fn range(&self, start: K, end: K) -> RangeCursor<K> {
        RangeCursor::new(Arc::clone(&self.entries), start, end)
    }

    /// Number of `(key, row)` pairs.
    pub fn len(&self) -> Result<usize, IndexError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.read()?.is_empty())
    }

    /// Replaces the whole content with `entries` in one pass.
    ///
    /// The new set is bulk-built from a sorted run outside the lock and
    /// swapped in, so readers see either the old or the new content.
    pub fn rebuild<I>(&self, entries: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = (K, RowId)>,
    {
        let mut run: Vec<(K, RowId)> = entries.into_iter().collect();
        run.sort_unstable();
        run.dedup();
        let count = run.len();
        let rebuilt: Entries<K> = run.into_iter().collect();

        *self.write()? = rebuilt;
        debug!(entries = count, "ordered index rebuilt");
        Ok(())
    }

    /// Smallest and largest key, if any.
    pub fn bounds(&self) -> Result<Option<(K, K)>, IndexError> {
        let entries = self.read()?;
        Ok(entries
            .first()
            .zip(entries.last())
            .map(|((lo, _), (hi, _))| (lo.clone(), hi.clone())))
    }
}

// ------------------------------------------------------------------------------------------------
// Range cursor
// ------------------------------------------------------------------------------------------------

/// Lazy, finite, restartable iterator over one inclusive key range.
///
/// The cursor does not pin the index. It reads the index one chunk at a
/// time, so writes made while it is open may or may not show up; a
/// [`restart`](RangeCursor::restart) rescans the current content.
#[derive(Debug)]
pub struct RangeCursor<K> {
    entries: Arc<RwLock<Entries<K>>>,
    start: K,
    end: K,
    /// Last pair yielded.
    position: Option<(K, RowId)>,
    buffer: VecDeque<(K, RowId)>,
    exhausted: bool,
}

impl<K: Ord + Clone> RangeCursor<K> {
    fn new(entries: Arc<RwLock<Entries<K>>>, start: K, end: K) -> Self {
        let exhausted = start > end;
        Self {
            entries,
            start,
            end,
            position: None,
            buffer: VecDeque::new(),
            exhausted,
        }
    }

    /// Rewinds the cursor to the start of its range.
    pub fn restart(&mut self) {
        self.position = None;
        self.buffer.clear();
        self.exhausted = self.start > self.end;
    }

    /// Bounds of the range this cursor walks.
    pub fn bounds(&self) -> (&K, &K) {
        (&self.start, &self.end)
    }

    fn refill(&mut self) -> Result<(), IndexError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| IndexError::Internal("RwLock poisoned".into()))?;

        let lower = match &self.position {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Included((self.start.clone(), RowId::MIN)),
        };
        let upper = Bound::Included((self.end.clone(), RowId::MAX));

        self.buffer
            .extend(entries.range((lower, upper)).take(CURSOR_CHUNK).cloned());
        if self.buffer.len() < CURSOR_CHUNK {
            self.exhausted = true;
        }
        trace!(fetched = self.buffer.len(), "range cursor refilled");
        Ok(())
    }
}

impl<K: Ord + Clone> Iterator for RangeCursor<K> {
    type Item = Result<(K, RowId), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let item = self.buffer.pop_front()?;
        self.position = Some(item.clone());
        Some(Ok(item))
    }
}
