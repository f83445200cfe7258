//! MemTable Module
//!
//! In-memory data structure for recent writes.
//!
//! ## Responsibilities
//! - Fast upserts and lookups in memory
//! - Track size for flush triggers
//! - Isolated, ordered range snapshots for readers
//! - Ordered iteration for segment creation
//!
//! ## Data Structure Choice
//! BTreeMap wrapped in RwLock:
//! - Ordered keys (required for segment generation and range scans)
//! - Writers hold the write lock only for the map insertion itself
//! - Once frozen, a memtable is never written again and is shared by
//!   `Arc` between readers and the flush worker

mod table;

use bytes::Bytes;

pub use table::{MemTable, MemTableSnapshot};

/// Entry stored in the MemTable
#[derive(Debug, Clone, PartialEq)]
pub enum MemTableEntry {
    /// A live value
    Value(Bytes),

    /// A tombstone (deleted key)
    Tombstone,
}

impl MemTableEntry {
    /// Bytes this entry's value contributes to the memtable size
    pub fn value_size(&self) -> usize {
        match self {
            MemTableEntry::Value(v) => v.len(),
            MemTableEntry::Tombstone => 0,
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            MemTableEntry::Value(v) => Some(v),
            MemTableEntry::Tombstone => None,
        }
    }
}

impl From<Option<Bytes>> for MemTableEntry {
    fn from(value: Option<Bytes>) -> Self {
        match value {
            Some(v) => MemTableEntry::Value(v),
            None => MemTableEntry::Tombstone,
        }
    }
}
