//! Engine utilities: cancellation tokens and name striping.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use super::EngineError;

/// Cooperative cancellation flag shared between a caller and an operation.
///
/// Operations check the token before taking locks and before every I/O
/// call. A cancelled operation returns [`EngineError::Cancelled`] without
/// having changed any state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Requests cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns [`EngineError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// Number of lock stripes protecting block names.
pub const STRIPES: usize = 64;

/// Stripe a block name maps to.
pub fn stripe_of(name: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() % STRIPES as u64) as usize
}
