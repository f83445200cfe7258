//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::MemTableEntry;
use crate::range::{Direction, KeyRange};
use crate::record::Record;

type EntryMap = BTreeMap<Bytes, MemTableEntry>;

/// In-memory table for recent writes
pub struct MemTable {
    /// Generation this memtable's data belongs to once flushed
    generation: u64,
    /// Shared with readers once frozen; never cloned while live
    data: RwLock<Arc<EntryMap>>,
    /// Sum of key + value sizes of live entries (bytes)
    size: AtomicUsize,
    frozen: AtomicBool,
}

impl MemTable {
    /// Create a new empty MemTable for `generation`
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            data: RwLock::new(Arc::new(BTreeMap::new())),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Insert or replace the entry for `record.key()`.
    ///
    /// Returns the memtable size after the write. Replacing a key only adds
    /// the difference between the old and new value sizes.
    pub fn upsert(&self, record: Record) -> usize {
        debug_assert!(!self.is_frozen(), "upsert into frozen memtable");

        let (key, value) = record.into_parts();
        let key_len = key.len();
        let entry = MemTableEntry::from(value);
        let added = entry.value_size();

        let mut guard = self.data.write();
        let data = Arc::make_mut(&mut guard);
        match data.insert(key, entry) {
            Some(old) => {
                let removed = old.value_size();
                if added >= removed {
                    self.size.fetch_add(added - removed, Ordering::SeqCst) + (added - removed)
                } else {
                    self.size.fetch_sub(removed - added, Ordering::SeqCst) - (removed - added)
                }
            }
            None => self.size.fetch_add(key_len + added, Ordering::SeqCst) + key_len + added,
        }
    }

    /// Get the current entry for a key
    pub fn get(&self, key: &[u8]) -> Option<MemTableEntry> {
        self.data.read().get(key).cloned()
    }

    /// Get approximate size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Mark read-only; called once the memtable is handed off for flushing
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Ordered view of the entries inside `range`.
    ///
    /// A live memtable is copied under the read lock, so later upserts never
    /// show up in (or invalidate) the returned snapshot. A frozen memtable
    /// never changes again: its map is shared and walked lazily.
    pub fn snapshot_range(&self, range: &KeyRange, direction: Direction) -> MemTableSnapshot {
        let data = self.data.read();
        let source = if self.is_frozen() {
            SnapshotSource::Shared {
                map: Arc::clone(&data),
                range: range.clone(),
                last: None,
            }
        } else {
            let records: Vec<Record> = data
                .range::<[u8], _>(range.as_bounds())
                .map(|(key, entry)| Record::from_parts(key.clone(), entry.clone().into_value()))
                .collect();
            SnapshotSource::Copied(records.into_iter())
        };

        MemTableSnapshot { source, direction }
    }

    /// All entries in ascending key order (for flush)
    pub fn iter(&self) -> MemTableSnapshot {
        self.snapshot_range(&KeyRange::all(), Direction::Ascending)
    }
}

/// Point-in-time view over a memtable range
pub struct MemTableSnapshot {
    source: SnapshotSource,
    direction: Direction,
}

enum SnapshotSource {
    /// Entries copied out of a live memtable
    Copied(std::vec::IntoIter<Record>),
    /// Frozen map, re-seeked past the last returned key on every step
    Shared {
        map: Arc<EntryMap>,
        range: KeyRange,
        last: Option<Bytes>,
    },
}

impl MemTableSnapshot {
    /// Whether no records remain
    pub fn is_empty(&self) -> bool {
        match &self.source {
            SnapshotSource::Copied(records) => records.len() == 0,
            SnapshotSource::Shared { map, range, last } => {
                shared_next(map, range, last.as_deref(), self.direction).is_none()
            }
        }
    }

    /// Whether records are read from the memtable without copying
    pub fn is_shared(&self) -> bool {
        matches!(self.source, SnapshotSource::Shared { .. })
    }
}

/// Next entry of a frozen map after `last` in `direction`
fn shared_next<'a>(
    map: &'a EntryMap,
    range: &KeyRange,
    last: Option<&[u8]>,
    direction: Direction,
) -> Option<(&'a Bytes, &'a MemTableEntry)> {
    let (lower, upper) = range.as_bounds();
    match direction {
        Direction::Ascending => {
            let lower = last.map_or(lower, Bound::Excluded);
            map.range::<[u8], _>((lower, upper)).next()
        }
        Direction::Descending => {
            let upper = last.map_or(upper, Bound::Excluded);
            map.range::<[u8], _>((lower, upper)).next_back()
        }
    }
}

impl Iterator for MemTableSnapshot {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            SnapshotSource::Copied(records) => match self.direction {
                Direction::Ascending => records.next(),
                Direction::Descending => records.next_back(),
            },
            SnapshotSource::Shared { map, range, last } => {
                let (key, entry) = shared_next(map, range, last.as_deref(), self.direction)?;
                let record = Record::from_parts(key.clone(), entry.clone().into_value());
                *last = Some(key.clone());
                Some(record)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            SnapshotSource::Copied(records) => records.size_hint(),
            SnapshotSource::Shared { map, .. } => (0, Some(map.len())),
        }
    }
}
