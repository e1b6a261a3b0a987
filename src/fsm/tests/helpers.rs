use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::fsm::Backing;

/// In-memory backing that records resizes and can be told to fail.
#[derive(Debug, Default)]
pub struct MemBacking {
    pub len: Mutex<u64>,
    pub fail: AtomicBool,
    pub resizes: AtomicUsize,
}

impl MemBacking {
    pub fn failing() -> Self {
        let backing = Self::default();
        backing.fail.store(true, Ordering::SeqCst);
        backing
    }

    pub fn len(&self) -> u64 {
        *self.len.lock().unwrap()
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::SeqCst)
    }
}

impl Backing for MemBacking {
    fn resize(&self, len: u64) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        }
        *self.len.lock().unwrap() = len;
        self.resizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub const PAGE: u64 = 4096;
