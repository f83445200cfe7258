//! Merge Iterator
//!
//! K-way merge of sorted record sources into one ordered, deduplicated
//! stream.
//!
//! Every source yields records with unique keys in the scan direction and
//! carries a unique [`Priority`]. When several sources hold the same key,
//! only the record from the highest-priority source is emitted and the
//! others are consumed alongside it. Tombstones are dropped from the output
//! unless the merge is building a segment that must keep them.
//!
//! Cost is O(records touched × log sources); nothing is materialized, so a
//! caller that stops early pays only for what it consumed.

use std::cmp::Ordering;
use std::collections::binary_heap::PeekMut;
use std::collections::BinaryHeap;

use crate::error::{DaoError, Result};
use crate::range::Direction;
use crate::record::Record;

/// A sorted stream of records from one source
pub type RecordSource = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Where a source lives; memory outranks disk at equal generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Disk,
    Memory,
}

/// Conflict-resolution rank of a source: higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    pub generation: u64,
    pub tier: Tier,
}

impl Priority {
    pub fn memory(generation: u64) -> Self {
        Self {
            generation,
            tier: Tier::Memory,
        }
    }

    pub fn disk(generation: u64) -> Self {
        Self {
            generation,
            tier: Tier::Disk,
        }
    }
}

/// Current head of one source
struct HeapEntry {
    record: Record,
    priority: Priority,
    direction: Direction,
    source: RecordSource,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Max-heap order: the next key in scan direction first, then the
    /// highest priority among equal keys
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = match self.direction {
            Direction::Ascending => other.record.key().cmp(self.record.key()),
            Direction::Descending => self.record.key().cmp(other.record.key()),
        };
        by_key.then_with(|| self.priority.cmp(&other.priority))
    }
}

/// Lazy merged view over several sorted sources
///
/// An error from any source is yielded once, after which the iterator is
/// exhausted; a partially merged result is never passed off as complete.
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    direction: Direction,
    filter_tombstones: bool,
    error: Option<DaoError>,
    done: bool,
}

impl MergeIterator {
    /// Merge `sources`, hiding keys whose newest record is a tombstone
    pub fn new(sources: Vec<(Priority, RecordSource)>, direction: Direction) -> Self {
        Self::build(sources, direction, true)
    }

    /// Merge `sources`, emitting winning tombstones as records
    pub fn with_tombstones(sources: Vec<(Priority, RecordSource)>, direction: Direction) -> Self {
        Self::build(sources, direction, false)
    }

    fn build(
        sources: Vec<(Priority, RecordSource)>,
        direction: Direction,
        filter_tombstones: bool,
    ) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            direction,
            filter_tombstones,
            error: None,
            done: false,
        };

        for (priority, source) in sources {
            if let Err(e) = merge.advance(priority, source) {
                merge.error.get_or_insert(e);
            }
        }

        merge
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Pull the next record of `source` into the heap
    fn advance(&mut self, priority: Priority, mut source: RecordSource) -> Result<()> {
        match source.next() {
            Some(Ok(record)) => {
                self.heap.push(HeapEntry {
                    record,
                    priority,
                    direction: self.direction,
                    source,
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: DaoError) -> Option<Result<Record>> {
        self.done = true;
        self.heap.clear();
        Some(Err(e))
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.error.take() {
            return self.fail(e);
        }

        loop {
            let Some(top) = self.heap.pop() else {
                self.done = true;
                return None;
            };
            let HeapEntry {
                record,
                priority,
                source,
                ..
            } = top;

            // Every other source at this key holds an older version
            loop {
                let shadowed = match self.heap.peek_mut() {
                    Some(entry) if entry.record.key() == record.key() => PeekMut::pop(entry),
                    _ => break,
                };
                if let Err(e) = self.advance(shadowed.priority, shadowed.source) {
                    return self.fail(e);
                }
            }

            if let Err(e) = self.advance(priority, source) {
                return self.fail(e);
            }

            if self.filter_tombstones && record.is_tombstone() {
                continue;
            }
            return Some(Ok(record));
        }
    }
}
