//! # Index Module
//!
//! In-memory secondary indexes that map column keys to row ids.
//!
//! - [`OrderedIndex`] keeps `(key, row)` pairs in key order and answers
//!   point lookups and inclusive range scans through a lazy
//!   [`RangeCursor`].
//! - [`HashIndex`] answers point lookups only, in amortized O(1), from a
//!   separate-chaining bucket table.
//!
//! Both allow duplicate keys (one key, many rows) and both offer a bulk
//! `rebuild` that replaces the whole content in one pass. Each index owns
//! its own lock, so readers of one index never wait on writers of another.
//!
//! Indexes refer to rows by [`RowId`] value only; they hold no reference
//! back into the storage engine and are rebuilt from the stored rows when
//! a table is opened.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

pub mod hash;
pub mod ordered;

pub use hash::HashIndex;
pub use ordered::{OrderedIndex, RangeCursor};

use std::fmt;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Position of a row, stored by value in every index entry.
pub type RowId = u64;

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Internal invariant violation (poisoned lock, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A column value as seen by an index.
///
/// Totally ordered: values of different kinds order by kind first
/// (`Int < Text < Bytes`), then by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::Int(value)
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Text(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Text(value)
    }
}

impl From<Vec<u8>> for IndexKey {
    fn from(value: Vec<u8>) -> Self {
        IndexKey::Bytes(value)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Int(v) => write!(f, "{v}"),
            IndexKey::Text(s) => write!(f, "{s:?}"),
            IndexKey::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}
