//! # Free-Space Manager
//!
//! Page-granular bookkeeping of which byte ranges of the backing file are
//! in use. The FSM is the only component that decides where new data may
//! be written.
//!
//! ## Structures
//!
//! - **Bitmap**: one bit per page, `1` = allocated.
//! - **Free-extent index**: every maximal run of free pages, kept twice:
//!   by start page (for coalescing with neighbours) and by `(length, start)`
//!   (for best-fit lookups).
//!
//! Both structures are updated under the same lock and always describe the
//! same set of free pages. [`FreeSpaceManager::check_invariants`] verifies
//! this and is exercised by the tests.
//!
//! ## Allocation policy
//!
//! 1. Best fit over the extent index (smallest run that fits, lowest start
//!    page on ties). The remainder of the run stays free.
//! 2. Fallback scan of the bitmap for enough contiguous free pages. A hit
//!    here means the index drifted; it is rebuilt from the bitmap.
//! 3. Grow the backing file. The first extension adds
//!    `initial_extension_pages`, every later one multiplies the previous
//!    extension by `growth_factor`. The in-memory state only changes after
//!    [`Backing::resize`] succeeded.
//!
//! ## Persistence
//!
//! [`FreeMapSnapshot`] captures the bitmap and growth state. The extent
//! index is never persisted; [`FreeSpaceManager::restore`] rebuilds it from
//! the bitmap.

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{Mutex, MutexGuard},
};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, warn};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const BITS_PER_WORD: u64 = 64;
const FREE_MAP_MAGIC: [u8; 4] = *b"BFSM";
const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by free-space operations.
#[derive(Debug, Error)]
pub enum FsmError {
    /// The backing file could not be extended.
    #[error("out of space: growing to {requested_pages} pages failed: {source}")]
    OutOfSpace {
        /// Page count the file was being grown to.
        requested_pages: u64,
        /// Error reported by the backing resize.
        #[source]
        source: io::Error,
    },

    /// Some page of the range was already free.
    #[error("double free of {0:?}")]
    DoubleFree(Extent),

    /// Some page of the range was already allocated.
    #[error("range {0:?} is already allocated")]
    AlreadyAllocated(Extent),

    /// The range is not inside the addressable file.
    #[error("range {extent:?} outside of file ({total_pages} pages)")]
    OutOfRange {
        /// Offending range.
        extent: Extent,
        /// Current page count.
        total_pages: u64,
    },

    /// Persisted free map failed validation.
    #[error("invalid free map: {0}")]
    InvalidMap(String),

    /// Persisted free map checksum mismatch.
    #[error("free map checksum mismatch")]
    ChecksumMismatch,

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Extent
// ------------------------------------------------------------------------------------------------

/// A contiguous run of file pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent {
    /// First page of the run.
    pub start_page: u64,

    /// Number of pages in the run.
    pub page_count: u64,
}

impl Extent {
    pub fn new(start_page: u64, page_count: u64) -> Self {
        Self {
            start_page,
            page_count,
        }
    }

    /// One past the last page.
    pub fn end_page(&self) -> u64 {
        self.start_page + self.page_count
    }

    /// Byte offset of the first page.
    pub fn byte_offset(&self, page_size: u64) -> u64 {
        self.start_page * page_size
    }

    /// Byte length of the run.
    pub fn byte_len(&self, page_size: u64) -> u64 {
        self.page_count * page_size
    }

    /// Returns `true` if the two runs share at least one page.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start_page < other.end_page() && other.start_page < self.end_page()
    }

    /// The extent covering `len` bytes at byte `offset` (offset page-aligned).
    pub fn from_bytes(offset: u64, len: u64, page_size: u64) -> Self {
        Self {
            start_page: offset / page_size,
            page_count: pages_for(len, page_size),
        }
    }
}

/// Number of pages needed for `bytes` (at least one).
pub fn pages_for(bytes: u64, page_size: u64) -> u64 {
    bytes.div_ceil(page_size).max(1)
}

// ------------------------------------------------------------------------------------------------
// Backing trait
// ------------------------------------------------------------------------------------------------

/// The storage the FSM hands out pages of.
///
/// The FSM never writes data itself; it only asks the backing to change its
/// length when it needs more pages.
pub trait Backing {
    /// Resize the backing storage to exactly `len` bytes.
    fn resize(&self, len: u64) -> io::Result<()>;
}

// ------------------------------------------------------------------------------------------------
// Persisted form
// ------------------------------------------------------------------------------------------------

/// Persisted form of the free-space state.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeMapSnapshot {
    /// Addressable pages at snapshot time.
    pub total_pages: u64,

    /// Size of the most recent file extension in pages (0 = never grown).
    pub last_extension: u64,

    /// Allocation bitmap, 64 pages per word, LSB first.
    pub words: Vec<u64>,
}

impl Encode for FreeMapSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.total_pages.encode_to(buf)?;
        self.last_extension.encode_to(buf)?;
        encoding::encode_vec(&self.words, buf)?;
        Ok(())
    }
}

impl Decode for FreeMapSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (total_pages, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_extension, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (words, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                total_pages,
                last_extension,
                words,
            },
            offset,
        ))
    }
}

impl FreeMapSnapshot {
    /// Encoded size of a snapshot covering `total_pages` pages, including
    /// magic and trailing CRC.
    pub fn sealed_len(total_pages: u64) -> u64 {
        let words = total_pages.div_ceil(BITS_PER_WORD);
        (FREE_MAP_MAGIC.len() + 8 + 8 + U32_SIZE + U32_SIZE) as u64 + words * 8
    }

    /// Marks `extent` free in this snapshot without touching the live map.
    pub fn release(&mut self, extent: Extent) {
        for page in extent.start_page..extent.end_page().min(self.total_pages) {
            if let Some(word) = self.words.get_mut((page / BITS_PER_WORD) as usize) {
                *word &= !(1u64 << (page % BITS_PER_WORD));
            }
        }
    }

    /// Serializes as `[magic][snapshot][crc32]`.
    pub fn seal_into(&self, buf: &mut Vec<u8>) -> Result<(), FsmError> {
        let start = buf.len();
        buf.extend_from_slice(&FREE_MAP_MAGIC);
        self.encode_to(buf)?;
        let mut hasher = Crc32::new();
        hasher.update(&buf[start..]);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(())
    }

    /// Parses and verifies bytes written by [`FreeMapSnapshot::seal_into`].
    pub fn unseal(bytes: &[u8]) -> Result<Self, FsmError> {
        if bytes.len() < FREE_MAP_MAGIC.len() + U32_SIZE || bytes[..4] != FREE_MAP_MAGIC {
            return Err(FsmError::InvalidMap("bad magic".into()));
        }
        let (snapshot, consumed) = FreeMapSnapshot::decode_from(&bytes[4..])?;
        let body_end = 4 + consumed;
        let (stored, _) = u32::decode_from(&bytes[body_end..])?;

        let mut hasher = Crc32::new();
        hasher.update(&bytes[..body_end]);
        if hasher.finalize() != stored {
            return Err(FsmError::ChecksumMismatch);
        }
        Ok(snapshot)
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Point-in-time counters of the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmStats {
    /// Addressable pages.
    pub total_pages: u64,
    /// Pages currently free.
    pub free_pages: u64,
    /// Number of maximal free runs.
    pub free_extents: usize,
    /// Length of the largest free run.
    pub largest_free_extent: u64,
    /// Size of the most recent extension (pages).
    pub last_extension: u64,
}

// ------------------------------------------------------------------------------------------------
// FSM core
// ------------------------------------------------------------------------------------------------

/// Thread-safe free-space manager.
///
/// See the [module-level documentation](self) for the allocation policy.
#[derive(Debug)]
pub struct FreeSpaceManager {
    /// Page size in bytes.
    page_size: u64,

    /// Pages added by the first extension.
    initial_extension: u64,

    /// Multiplier applied to each following extension.
    growth_factor: u64,

    /// Bitmap and extent index, updated together.
    state: Mutex<FsmState>,
}

#[derive(Debug, Default)]
struct FsmState {
    total_pages: u64,
    last_extension: u64,
    free_pages: u64,
    bitmap: Vec<u64>,
    by_start: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
}

impl FreeSpaceManager {
    /// Creates an FSM over `total_pages` pages, all free.
    pub fn new(page_size: u64, total_pages: u64, initial_extension: u64, growth_factor: u64) -> Self {
        let mut state = FsmState {
            total_pages,
            free_pages: total_pages,
            bitmap: vec![0; words_for(total_pages)],
            ..FsmState::default()
        };
        if total_pages > 0 {
            state.insert_free(0, total_pages);
        }
        Self {
            page_size,
            initial_extension: initial_extension.max(1),
            growth_factor: growth_factor.max(2),
            state: Mutex::new(state),
        }
    }

    /// Rebuilds an FSM from a persisted snapshot.
    pub fn restore(
        page_size: u64,
        snapshot: &FreeMapSnapshot,
        initial_extension: u64,
        growth_factor: u64,
    ) -> Result<Self, FsmError> {
        let expected_words = words_for(snapshot.total_pages);
        if snapshot.words.len() != expected_words {
            return Err(FsmError::InvalidMap(format!(
                "{} words for {} pages (expected {})",
                snapshot.words.len(),
                snapshot.total_pages,
                expected_words
            )));
        }
        let tail_bits = snapshot.total_pages % BITS_PER_WORD;
        if tail_bits != 0 {
            if let Some(last) = snapshot.words.last() {
                if last >> tail_bits != 0 {
                    return Err(FsmError::InvalidMap("bits set past the last page".into()));
                }
            }
        }

        let mut state = FsmState {
            total_pages: snapshot.total_pages,
            last_extension: snapshot.last_extension,
            bitmap: snapshot.words.clone(),
            ..FsmState::default()
        };
        state.rebuild_index();

        debug!(
            total_pages = state.total_pages,
            free_pages = state.free_pages,
            free_extents = state.by_start.len(),
            "free-space map restored"
        );

        Ok(Self {
            page_size,
            initial_extension: initial_extension.max(1),
            growth_factor: growth_factor.max(2),
            state: Mutex::new(state),
        })
    }

    /// Acquires the state lock, mapping a poisoned mutex to
    /// [`FsmError::Internal`].
    fn lock_state(&self) -> Result<MutexGuard<'_, FsmState>, FsmError> {
        self.state.lock().map_err(|_| {
            error!("Mutex poisoned");
            FsmError::Internal("Mutex poisoned".into())
        })
    }

    /// Allocates room for `bytes` bytes, growing `backing` when no free run
    /// is large enough.
    pub fn allocate(&self, bytes: u64, backing: &dyn Backing) -> Result<Extent, FsmError> {
        let pages = pages_for(bytes, self.page_size);
        let mut state = self.lock_state()?;

        if let Some(extent) = state.take_best_fit(pages) {
            return Ok(extent);
        }

        if let Some(start) = state.scan_bitmap(pages) {
            warn!(
                start,
                pages, "free run missing from extent index; rebuilding from bitmap"
            );
            state.rebuild_index();
            let extent = Extent::new(start, pages);
            state.claim(extent)?;
            return Ok(extent);
        }

        // Grow. A free run touching the end of the file counts towards the request.
        let trailing = state.trailing_free();
        let needed = pages - trailing.min(pages);
        let planned = if state.last_extension == 0 {
            self.initial_extension
        } else {
            state.last_extension.saturating_mul(self.growth_factor)
        };
        let extension = planned.max(needed);
        let new_total = state.total_pages.saturating_add(extension);

        let new_len = new_total
            .checked_mul(self.page_size)
            .ok_or_else(|| FsmError::OutOfSpace {
                requested_pages: new_total,
                source: io::Error::other("file length overflows u64"),
            })?;

        backing.resize(new_len).map_err(|source| {
            error!(new_total, "file growth failed: {source}");
            FsmError::OutOfSpace {
                requested_pages: new_total,
                source,
            }
        })?;

        let old_total = state.total_pages;
        state.total_pages = new_total;
        state.last_extension = extension;
        state.bitmap.resize(words_for(new_total), 0);
        state.free_pages += extension;
        state.insert_free(old_total, extension);

        info!(
            old_pages = old_total,
            new_pages = new_total,
            extension,
            "backing file extended"
        );

        state
            .take_best_fit(pages)
            .ok_or_else(|| FsmError::Internal("no fit after growth".into()))
    }

    /// Returns an extent to the free pool, coalescing with its neighbours.
    pub fn free(&self, extent: Extent) -> Result<(), FsmError> {
        let mut state = self.lock_state()?;
        state.check_range(extent)?;
        if !state.all_allocated(extent) {
            return Err(FsmError::DoubleFree(extent));
        }
        state.set_bits(extent, false);
        state.free_pages += extent.page_count;
        state.insert_free(extent.start_page, extent.page_count);
        Ok(())
    }

    /// Marks a fixed range as allocated (header page, log region, extents
    /// discovered during recovery).
    pub fn reserve(&self, extent: Extent) -> Result<(), FsmError> {
        let mut state = self.lock_state()?;
        state.check_range(extent)?;
        state.claim(extent)
    }

    /// Returns `true` if every page of `extent` is allocated.
    pub fn is_allocated(&self, extent: Extent) -> Result<bool, FsmError> {
        let state = self.lock_state()?;
        state.check_range(extent)?;
        Ok(state.all_allocated(extent))
    }

    /// Captures the bitmap and growth state.
    pub fn snapshot(&self) -> Result<FreeMapSnapshot, FsmError> {
        let state = self.lock_state()?;
        Ok(FreeMapSnapshot {
            total_pages: state.total_pages,
            last_extension: state.last_extension,
            words: state.bitmap.clone(),
        })
    }

    /// Addressable pages.
    pub fn total_pages(&self) -> Result<u64, FsmError> {
        Ok(self.lock_state()?.total_pages)
    }

    /// Current counters.
    pub fn stats(&self) -> Result<FsmStats, FsmError> {
        let state = self.lock_state()?;
        Ok(FsmStats {
            total_pages: state.total_pages,
            free_pages: state.free_pages,
            free_extents: state.by_start.len(),
            largest_free_extent: state.by_size.iter().next_back().map_or(0, |(len, _)| *len),
            last_extension: state.last_extension,
        })
    }

    /// Verifies that the extent index and the bitmap describe the same free
    /// pages, that free runs are maximal and disjoint, and that the free
    /// page counter is exact.
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.state.lock().map_err(|_| "Mutex poisoned".to_string())?;

        if state.by_start.len() != state.by_size.len() {
            return Err("extent index views differ in size".into());
        }
        let mut prev_end: Option<u64> = None;
        let mut indexed_free = 0;
        for (&start, &len) in &state.by_start {
            if len == 0 {
                return Err(format!("empty free run at {start}"));
            }
            if !state.by_size.contains(&(len, start)) {
                return Err(format!("run {start}+{len} missing from size index"));
            }
            if let Some(end) = prev_end {
                if start <= end {
                    return Err(format!("run at {start} overlaps or touches previous run"));
                }
            }
            if start + len > state.total_pages {
                return Err(format!("run {start}+{len} past end of file"));
            }
            for page in start..start + len {
                if state.bit(page) {
                    return Err(format!("page {page} indexed free but allocated in bitmap"));
                }
            }
            indexed_free += len;
            prev_end = Some(start + len);
        }

        let bitmap_free = (0..state.total_pages).filter(|p| !state.bit(*p)).count() as u64;
        if bitmap_free != indexed_free {
            return Err(format!(
                "bitmap has {bitmap_free} free pages, index has {indexed_free}"
            ));
        }
        if state.free_pages != indexed_free {
            return Err(format!(
                "free counter {} differs from index {indexed_free}",
                state.free_pages
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// State helpers
// ------------------------------------------------------------------------------------------------

fn words_for(pages: u64) -> usize {
    pages.div_ceil(BITS_PER_WORD) as usize
}

impl FsmState {
    fn bit(&self, page: u64) -> bool {
        let word = self.bitmap[(page / BITS_PER_WORD) as usize];
        word & (1u64 << (page % BITS_PER_WORD)) != 0
    }

    fn set_bits(&mut self, extent: Extent, allocated: bool) {
        for page in extent.start_page..extent.end_page() {
            let word = &mut self.bitmap[(page / BITS_PER_WORD) as usize];
            let mask = 1u64 << (page % BITS_PER_WORD);
            if allocated {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }

    fn all_allocated(&self, extent: Extent) -> bool {
        (extent.start_page..extent.end_page()).all(|p| self.bit(p))
    }

    fn check_range(&self, extent: Extent) -> Result<(), FsmError> {
        if extent.page_count == 0 || extent.end_page() > self.total_pages {
            return Err(FsmError::OutOfRange {
                extent,
                total_pages: self.total_pages,
            });
        }
        Ok(())
    }

    fn add_run(&mut self, start: u64, len: u64) {
        self.by_start.insert(start, len);
        self.by_size.insert((len, start));
    }

    fn remove_run(&mut self, start: u64, len: u64) {
        self.by_start.remove(&start);
        self.by_size.remove(&(len, start));
    }

    /// Inserts a free run, merging with the runs immediately before and
    /// after it.
    fn insert_free(&mut self, mut start: u64, mut len: u64) {
        if let Some((&left_start, &left_len)) = self.by_start.range(..start).next_back() {
            if left_start + left_len == start {
                self.remove_run(left_start, left_len);
                start = left_start;
                len += left_len;
            }
        }
        if let Some(&right_len) = self.by_start.get(&(start + len)) {
            self.remove_run(start + len, right_len);
            len += right_len;
        }
        self.add_run(start, len);
    }

    /// Removes the smallest run of at least `pages` pages and returns its
    /// first `pages` pages as allocated.
    fn take_best_fit(&mut self, pages: u64) -> Option<Extent> {
        let (len, start) = *self.by_size.range((pages, 0)..).next()?;
        self.remove_run(start, len);
        if len > pages {
            self.add_run(start + pages, len - pages);
        }
        let extent = Extent::new(start, pages);
        self.set_bits(extent, true);
        self.free_pages -= pages;
        Some(extent)
    }

    /// Marks a free range allocated, splitting the run that contains it.
    fn claim(&mut self, extent: Extent) -> Result<(), FsmError> {
        let (run_start, run_len) = match self.by_start.range(..=extent.start_page).next_back() {
            Some((&s, &l)) if s + l >= extent.end_page() => (s, l),
            _ => return Err(FsmError::AlreadyAllocated(extent)),
        };
        self.remove_run(run_start, run_len);
        if extent.start_page > run_start {
            self.add_run(run_start, extent.start_page - run_start);
        }
        let run_end = run_start + run_len;
        if run_end > extent.end_page() {
            self.add_run(extent.end_page(), run_end - extent.end_page());
        }
        self.set_bits(extent, true);
        self.free_pages -= extent.page_count;
        Ok(())
    }

    /// Length of the free run ending exactly at `total_pages`.
    fn trailing_free(&self) -> u64 {
        match self.by_start.iter().next_back() {
            Some((&start, &len)) if start + len == self.total_pages => len,
            _ => 0,
        }
    }

    /// Linear scan of the bitmap for `pages` contiguous free pages.
    fn scan_bitmap(&self, pages: u64) -> Option<u64> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut page = 0;
        while page < self.total_pages {
            // Skip fully allocated words.
            if page % BITS_PER_WORD == 0 && self.bitmap[(page / BITS_PER_WORD) as usize] == u64::MAX
            {
                run_len = 0;
                page += BITS_PER_WORD;
                continue;
            }
            if self.bit(page) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = page;
                }
                run_len += 1;
                if run_len == pages {
                    return Some(run_start);
                }
            }
            page += 1;
        }
        None
    }

    /// Recomputes the extent index and free counter from the bitmap.
    fn rebuild_index(&mut self) {
        self.by_start.clear();
        self.by_size.clear();
        self.free_pages = 0;
        let mut page = 0;
        while page < self.total_pages {
            if self.bit(page) {
                page += 1;
                continue;
            }
            let start = page;
            while page < self.total_pages && !self.bit(page) {
                page += 1;
            }
            self.add_run(start, page - start);
            self.free_pages += page - start;
        }
    }
}
