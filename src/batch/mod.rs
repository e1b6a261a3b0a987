//! # Write Batching
//!
//! Buffers mutations between durability flushes and serves them to
//! readers until they reach block storage.
//!
//! ## State machine
//!
//! ```text
//!            stage()                take_for_flush()
//!   Empty ───────────▶ Accumulating ─────────────────▶ Flushing
//!     ▲                                                   │
//!     └────────────────────── finish_flush() ─────────────┘
//! ```
//!
//! While a flush is in progress new mutations go into a fresh accumulating
//! buffer, so producers never wait for the disk. The in-flight set stays
//! readable until the engine has applied it to the registry.
//!
//! ## Explicit batches
//!
//! [`Batcher::begin`] opens a store-wide batch: every mutation staged while
//! it is open is held in a separate buffer that timer and threshold flushes
//! never see. [`Batcher::end`] moves the whole buffer into the accumulating
//! set in one step, so the next flush writes it as a single commit group.
//! [`Batcher::cancel`] drops it.
//!
//! ## Read precedence
//!
//! explicit batch → accumulating → in flight → (registry, in the engine).
//!
//! Repeated mutations of one name inside a buffer replace each other; only
//! the last one is ever logged.

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::wal::framed_len;
use thiserror::Error;
use tracing::{debug, error, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by batch operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// `begin` while a batch is already open.
    #[error("a batch is already active")]
    AlreadyActive,

    /// `end` / `cancel` without an open batch.
    #[error("no batch is active")]
    NotActive,

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Pending writes
// ------------------------------------------------------------------------------------------------

/// A buffered mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// New contents of the block.
    Put(Vec<u8>),
    /// Removal of the block.
    Delete,
}

/// A buffered mutation of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub name: String,
    pub op: PendingOp,
}

impl PendingWrite {
    /// Bytes this write occupies once framed in the log.
    pub fn log_len(&self) -> u64 {
        match &self.op {
            PendingOp::Put(payload) => framed_len(self.name.len(), payload.len()),
            PendingOp::Delete => framed_len(self.name.len(), 0),
        }
    }
}

/// What the buffered state says about a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// A buffered put; these are the current contents.
    Present(Vec<u8>),
    /// A buffered delete.
    Deleted,
    /// Nothing buffered; ask the registry.
    Unknown,
}

/// Phase of the flush pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    /// Nothing buffered, nothing in flight.
    Empty,
    /// Mutations buffered, no flush running.
    Accumulating,
    /// A flush is writing the in-flight set.
    Flushing,
}

/// Ordered, name-deduplicated set of writes.
#[derive(Debug, Default)]
pub struct WriteSet {
    writes: Vec<PendingWrite>,
    index: HashMap<String, usize>,
    log_bytes: u64,
}

impl WriteSet {
    fn stage(&mut self, write: PendingWrite) {
        self.log_bytes += write.log_len();
        match self.index.get(&write.name) {
            Some(&slot) => {
                self.log_bytes -= self.writes[slot].log_len();
                self.writes[slot] = write;
            }
            None => {
                self.index.insert(write.name.clone(), self.writes.len());
                self.writes.push(write);
            }
        }
    }

    fn get(&self, name: &str) -> Option<&PendingOp> {
        self.index.get(name).map(|&slot| &self.writes[slot].op)
    }

    fn absorb(&mut self, other: WriteSet) {
        for write in other.writes {
            self.stage(write);
        }
    }

    /// Writes in staging order.
    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Framed size of all writes, without the closing commit.
    pub fn log_bytes(&self) -> u64 {
        self.log_bytes
    }
}

// ------------------------------------------------------------------------------------------------
// Batcher
// ------------------------------------------------------------------------------------------------

/// Counters of the buffered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub phase: BatchPhase,
    pub accumulating: usize,
    pub in_flight: usize,
    pub in_batch: Option<usize>,
}

#[derive(Debug, Default)]
struct BatcherState {
    accumulating: WriteSet,
    accumulating_since: Option<Instant>,
    in_flight: Option<Arc<WriteSet>>,
    explicit: Option<WriteSet>,
}

/// Buffer of not-yet-durable mutations.
#[derive(Debug)]
pub struct Batcher {
    max_records: usize,
    max_bytes: u64,
    state: Mutex<BatcherState>,
}

impl Batcher {
    pub fn new(max_records: usize, max_bytes: u64) -> Self {
        Self {
            max_records: max_records.max(1),
            max_bytes: max_bytes.max(1),
            state: Mutex::new(BatcherState::default()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BatcherState>, BatchError> {
        self.state.lock().map_err(|_| {
            error!("Mutex poisoned");
            BatchError::Internal("Mutex poisoned".into())
        })
    }

    /// Buffers a mutation. Returns `true` when the accumulating set reached
    /// a size threshold and should be flushed.
    pub fn stage(&self, name: String, op: PendingOp) -> Result<bool, BatchError> {
        let mut state = self.lock_state()?;
        let write = PendingWrite { name, op };
        trace!(name = %write.name, "mutation staged");

        if let Some(batch) = state.explicit.as_mut() {
            batch.stage(write);
            return Ok(false);
        }

        if state.accumulating.is_empty() {
            state.accumulating_since = Some(Instant::now());
        }
        state.accumulating.stage(write);
        Ok(state.accumulating.len() >= self.max_records
            || state.accumulating.log_bytes() >= self.max_bytes)
    }

    /// Buffered view of `name`.
    pub fn lookup(&self, name: &str) -> Result<Pending, BatchError> {
        let state = self.lock_state()?;
        let op = state
            .explicit
            .as_ref()
            .and_then(|batch| batch.get(name))
            .or_else(|| state.accumulating.get(name))
            .or_else(|| state.in_flight.as_ref().and_then(|set| set.get(name)));
        Ok(match op {
            Some(PendingOp::Put(bytes)) => Pending::Present(bytes.clone()),
            Some(PendingOp::Delete) => Pending::Deleted,
            None => Pending::Unknown,
        })
    }

    /// Buffered mutations of names starting with `prefix`, oldest buffer
    /// first. Applying them in order over the registry gives the visible
    /// state.
    pub fn overlay(&self, prefix: &str) -> Result<Vec<(String, bool)>, BatchError> {
        let state = self.lock_state()?;
        let sets = state
            .in_flight
            .as_deref()
            .into_iter()
            .chain(std::iter::once(&state.accumulating))
            .chain(state.explicit.as_ref());

        let mut out = Vec::new();
        for set in sets {
            for write in set.writes().iter().filter(|w| w.name.starts_with(prefix)) {
                out.push((write.name.clone(), matches!(write.op, PendingOp::Put(_))));
            }
        }
        Ok(out)
    }

    /// `true` if the accumulating set has waited at least `interval`.
    pub fn due_by_age(&self, interval: Duration) -> Result<bool, BatchError> {
        let state = self.lock_state()?;
        Ok(state
            .accumulating_since
            .is_some_and(|since| since.elapsed() >= interval))
    }

    /// Current phase of the pipeline.
    #[cfg(test)]
    pub fn phase(&self) -> Result<BatchPhase, BatchError> {
        let state = self.lock_state()?;
        Ok(Self::phase_of(&state))
    }

    fn phase_of(state: &BatcherState) -> BatchPhase {
        if state.in_flight.is_some() {
            BatchPhase::Flushing
        } else if !state.accumulating.is_empty() {
            BatchPhase::Accumulating
        } else {
            BatchPhase::Empty
        }
    }

    pub fn stats(&self) -> Result<BatchStats, BatchError> {
        let state = self.lock_state()?;
        Ok(BatchStats {
            phase: Self::phase_of(&state),
            accumulating: state.accumulating.len(),
            in_flight: state.in_flight.as_ref().map_or(0, |set| set.len()),
            in_batch: state.explicit.as_ref().map(WriteSet::len),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Flush hand-off
    // --------------------------------------------------------------------------------------------

    /// Moves the accumulating set in flight. Returns `None` when there is
    /// nothing to flush.
    ///
    /// Callers serialize flushes; a set still in flight is an error.
    pub fn take_for_flush(&self) -> Result<Option<Arc<WriteSet>>, BatchError> {
        let mut state = self.lock_state()?;
        if state.in_flight.is_some() {
            return Err(BatchError::Internal("previous flush still in flight".into()));
        }
        if state.accumulating.is_empty() {
            return Ok(None);
        }

        let set = Arc::new(std::mem::take(&mut state.accumulating));
        state.accumulating_since = None;
        state.in_flight = Some(Arc::clone(&set));
        debug!(writes = set.len(), bytes = set.log_bytes(), "batch moved to flushing");
        Ok(Some(set))
    }

    /// Drops the in-flight set once it is applied to the registry.
    pub fn finish_flush(&self) -> Result<(), BatchError> {
        self.lock_state()?.in_flight = None;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Explicit batches
    // --------------------------------------------------------------------------------------------

    /// Opens a store-wide batch.
    pub fn begin(&self) -> Result<(), BatchError> {
        let mut state = self.lock_state()?;
        if state.explicit.is_some() {
            return Err(BatchError::AlreadyActive);
        }
        state.explicit = Some(WriteSet::default());
        debug!("batch opened");
        Ok(())
    }

    /// Closes the batch, moving its writes into the accumulating set.
    /// Returns the number of writes the batch held.
    pub fn end(&self) -> Result<usize, BatchError> {
        let mut state = self.lock_state()?;
        let batch = state.explicit.take().ok_or(BatchError::NotActive)?;
        let count = batch.len();
        if !batch.is_empty() && state.accumulating.is_empty() {
            state.accumulating_since = Some(Instant::now());
        }
        state.accumulating.absorb(batch);
        debug!(writes = count, "batch closed");
        Ok(count)
    }

    /// Discards the batch. Returns the number of writes dropped.
    pub fn cancel(&self) -> Result<usize, BatchError> {
        let mut state = self.lock_state()?;
        let batch = state.explicit.take().ok_or(BatchError::NotActive)?;
        debug!(writes = batch.len(), "batch cancelled");
        Ok(batch.len())
    }

    /// `true` while an explicit batch is open.
    pub fn in_batch(&self) -> Result<bool, BatchError> {
        Ok(self.lock_state()?.explicit.is_some())
    }
}
