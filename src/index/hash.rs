//! Hash index with separate chaining.
//!
//! Buckets are a power-of-two array of chains; every slot keeps the full
//! 64-bit hash of its key so growth rehashes without touching the keys and
//! lookups compare hashes before keys. The table doubles once the load
//! factor would exceed [`MAX_LOAD`].

use std::{
    hash::{BuildHasher, Hash, RandomState},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, trace};

use super::{IndexError, RowId};

/// Smallest bucket array.
pub const MIN_BUCKETS: usize = 16;

/// Maximum entries per bucket before the table doubles.
pub const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone)]
struct Slot<K> {
    hash: u64,
    key: K,
    row: RowId,
}

#[derive(Debug)]
struct Buckets<K> {
    chains: Vec<Vec<Slot<K>>>,
    len: usize,
}

impl<K> Buckets<K> {
    fn with_buckets(count: usize) -> Self {
        Self {
            chains: (0..count).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn chain_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.chains.len() - 1)
    }

    fn push(&mut self, slot: Slot<K>) {
        let idx = self.chain_of(slot.hash);
        self.chains[idx].push(slot);
        self.len += 1;
    }

    fn grow(&mut self) {
        let mut grown = Buckets::with_buckets(self.chains.len() * 2);
        for slot in self.chains.drain(..).flatten() {
            grown.push(slot);
        }
        trace!(buckets = grown.chains.len(), "hash index grown");
        *self = grown;
    }
}

/// Bucket count that holds `entries` at or below [`MAX_LOAD`].
fn buckets_for(entries: usize) -> usize {
    let needed = (entries as f64 / MAX_LOAD).ceil() as usize;
    needed.max(MIN_BUCKETS).next_power_of_two()
}

/// Unordered multimap from key to row ids.
#[derive(Debug)]
pub struct HashIndex<K> {
    hasher: RandomState,
    buckets: RwLock<Buckets<K>>,
}

impl<K> Default for HashIndex<K> {
    fn default() -> Self {
        Self {
            hasher: RandomState::new(),
            buckets: RwLock::new(Buckets::with_buckets(MIN_BUCKETS)),
        }
    }
}

impl<K: Hash + Eq + Clone> HashIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Buckets<K>>, IndexError> {
        self.buckets
            .read()
            .map_err(|_| IndexError::Internal("RwLock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Buckets<K>>, IndexError> {
        self.buckets
            .write()
            .map_err(|_| IndexError::Internal("RwLock poisoned".into()))
    }

    /// Adds `(key, row)`. Returns `false` if the pair was already present.
    pub fn insert(&self, key: K, row: RowId) -> Result<bool, IndexError> {
        let hash = self.hasher.hash_one(&key);
        let mut buckets = self.write()?;

        let idx = buckets.chain_of(hash);
        if buckets.chains[idx]
            .iter()
            .any(|s| s.hash == hash && s.row == row && s.key == key)
        {
            return Ok(false);
        }

        if (buckets.len + 1) as f64 > buckets.chains.len() as f64 * MAX_LOAD {
            buckets.grow();
        }
        buckets.push(Slot { hash, key, row });
        Ok(true)
    }

    /// Removes `(key, row)`. Returns `false` if the pair was absent.
    pub fn remove(&self, key: &K, row: RowId) -> Result<bool, IndexError> {
        let hash = self.hasher.hash_one(key);
        let mut buckets = self.write()?;

        let idx = buckets.chain_of(hash);
        let chain = &mut buckets.chains[idx];
        match chain
            .iter()
            .position(|s| s.hash == hash && s.row == row && &s.key == key)
        {
            Some(pos) => {
                chain.swap_remove(pos);
                buckets.len -= 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rows stored under `key`, ascending.
    pub fn lookup(&self, key: &K) -> Result<Vec<RowId>, IndexError> {
        let hash = self.hasher.hash_one(key);
        let buckets = self.read()?;

        let mut rows: Vec<RowId> = buckets.chains[buckets.chain_of(hash)]
            .iter()
            .filter(|s| s.hash == hash && &s.key == key)
            .map(|s| s.row)
            .collect();
        rows.sort_unstable();
        Ok(rows)
    }

    /// Number of `(key, row)` pairs.
    pub fn len(&self) -> Result<usize, IndexError> {
        Ok(self.read()?.len)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.read()?.len == 0)
    }

    /// Current size of the bucket array.
    pub fn bucket_count(&self) -> Result<usize, IndexError> {
        Ok(self.read()?.chains.len())
    }

    /// Replaces the whole content with `entries` in one pass.
    ///
    /// The bucket array is sized for the final count up front, so the
    /// rebuild never rehashes.
    pub fn rebuild<I>(&self, entries: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = (K, RowId)>,
    {
        let slots: Vec<Slot<K>> = entries
            .into_iter()
            .map(|(key, row)| Slot {
                hash: self.hasher.hash_one(&key),
                key,
                row,
            })
            .collect();

        let mut rebuilt = Buckets::with_buckets(buckets_for(slots.len()));
        for slot in slots {
            let duplicate = rebuilt.chains[rebuilt.chain_of(slot.hash)]
                .iter()
                .any(|s| s.hash == slot.hash && s.row == slot.row && s.key == slot.key);
            if !duplicate {
                rebuilt.push(slot);
            }
        }

        let count = rebuilt.len;
        *self.write()? = rebuilt;
        debug!(entries = count, "hash index rebuilt");
        Ok(())
    }
}
