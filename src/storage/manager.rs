//! Segment Manager
//!
//! Manages the on-disk segments and coordinates flushes and compaction.
//!
//! ## Responsibilities
//! - Discover existing segments on startup and clean up crash leftovers
//! - Hand out generation numbers
//! - Create new segments from frozen memtables
//! - Merge segments to bound their count and drop deleted keys
//!
//! ## Generations
//! Every memtable gets a generation when it is created; its flushed segment
//! covers exactly that generation. A compaction output covers the union of
//! its inputs' spans and is ranked by the highest of them, so a memtable
//! flushed while a compaction runs still outranks the compaction output.
//! On startup, a segment whose span lies inside another's is a leftover of
//! an interrupted compaction and is deleted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::DaoConfig;
use crate::error::{DaoError, Result};
use crate::memtable::MemTable;
use crate::merge::{MergeIterator, Priority, RecordSource};
use crate::range::Direction;

use super::segment::{Segment, SegmentBuilder, SEGMENT_EXTENSION, TEMP_EXTENSION};

/// Records merged between cancellation checks during compaction
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Immutable view of the segment list, oldest generation first
pub type SegmentList = Arc<Vec<Arc<Segment>>>;

/// Manages the storage layer
///
/// ## Concurrency:
/// - `segments`: the list is replaced, never mutated in place; readers clone
///   the `Arc` under a brief read lock and iterate without locking
/// - `next_generation`: Atomic counter (lock-free)
/// - `compaction_lock`: at most one compaction at a time
pub struct SegmentManager {
    /// Directory where segments are stored
    data_dir: PathBuf,
    index_interval: usize,
    max_segments: usize,
    tombstone_ratio_threshold: f64,
    segments: RwLock<SegmentList>,
    next_generation: AtomicU64,
    compaction_lock: Mutex<()>,
}

impl SegmentManager {
    /// Open or create storage described by `config`
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Delete unpublished `*.tmp` files
    /// 3. Open and verify every segment file
    /// 4. Delete segments superseded by a compaction output
    /// 5. Order oldest → newest
    pub fn open(config: &DaoConfig) -> Result<Self> {
        let path = config.data_dir.as_path();
        fs::create_dir_all(path)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(path)? {
            let file_path = entry?.path();
            if !file_path.is_file() {
                continue;
            }

            match file_path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXTENSION) => {
                    tracing::warn!("Removing unpublished segment {}", file_path.display());
                    fs::remove_file(&file_path)?;
                }
                Some(SEGMENT_EXTENSION) => {
                    let Some((_, _, file_id)) = Self::parse_segment_name(&file_path) else {
                        continue;
                    };
                    match Segment::open(&file_path) {
                        Ok(segment) => found.push((file_id, Arc::new(segment))),
                        Err(e @ DaoError::CorruptSegment { .. }) => {
                            if !config.quarantine_corrupt_segments {
                                tracing::error!("{}", e);
                                return Err(e);
                            }
                            let quarantined = file_path.with_extension("corrupt");
                            tracing::error!(
                                "{}; moved to {} and excluded from reads",
                                e,
                                quarantined.display()
                            );
                            fs::rename(&file_path, &quarantined)?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => {}
            }
        }

        let highest = found
            .iter()
            .map(|(file_id, s)| s.max_generation().max(*file_id))
            .max()
            .unwrap_or(0);
        let segments = Self::resolve_superseded(found);

        tracing::info!(
            "Opened {} segment(s) in {}, next generation {}",
            segments.len(),
            path.display(),
            highest + 1
        );

        Ok(Self {
            data_dir: path.to_path_buf(),
            index_interval: config.index_interval,
            max_segments: config.max_segments,
            tombstone_ratio_threshold: config.tombstone_ratio_threshold,
            segments: RwLock::new(Arc::new(segments)),
            next_generation: AtomicU64::new(highest + 1),
            compaction_lock: Mutex::new(()),
        })
    }

    /// Keep the widest, most recently written segment of every overlapping
    /// group, oldest first
    fn resolve_superseded(mut found: Vec<(u64, Arc<Segment>)>) -> Vec<Arc<Segment>> {
        // Newest first; among equal max generation the widest span first,
        // then the most recently written file
        found.sort_by(|(a_id, a), (b_id, b)| {
            b.max_generation()
                .cmp(&a.max_generation())
                .then(a.min_generation().cmp(&b.min_generation()))
                .then(b_id.cmp(a_id))
        });

        let mut kept: Vec<Arc<Segment>> = Vec::with_capacity(found.len());
        for (_, segment) in found {
            if let Some(newer) = kept.last() {
                if segment.max_generation() >= newer.min_generation() {
                    tracing::info!(
                        "Segment {} is superseded by {}, removing",
                        segment.path().display(),
                        newer.path().display()
                    );
                    segment.mark_obsolete();
                    continue;
                }
            }
            kept.push(segment);
        }

        kept.reverse();
        kept
    }

    /// Reserve the next generation number
    pub fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Current segment list, oldest first
    pub fn snapshot(&self) -> SegmentList {
        Arc::clone(&self.segments.read())
    }

    /// Write a frozen memtable to a new segment and publish it
    ///
    /// Returns `None` for an empty memtable.
    pub fn flush(&self, memtable: &MemTable) -> Result<Option<Arc<Segment>>> {
        if memtable.is_empty() {
            return Ok(None);
        }

        let generation = memtable.generation();
        let path = self.segment_path(generation, generation, generation);
        let mut builder = SegmentBuilder::new(&path, generation, generation, self.index_interval)?;
        for record in memtable.iter() {
            builder.add(&record)?;
        }
        let meta = builder.finish()?;

        let segment = Arc::new(Segment::open(&meta.path)?);
        self.publish(&[], Arc::clone(&segment));

        tracing::debug!(
            "Flushed generation {} ({} records, {} bytes) to {}",
            generation,
            meta.record_count,
            meta.file_size,
            meta.path.display()
        );

        Ok(Some(segment))
    }

    /// True when the segment count or tombstone share calls for compaction
    pub fn needs_compaction(&self) -> bool {
        let segments = self.snapshot();
        if segments.len() > self.max_segments {
            return true;
        }

        let records: u64 = segments.iter().map(|s| s.record_count()).sum();
        let tombstones: u64 = segments.iter().map(|s| s.tombstone_count()).sum();
        tombstones > 0 && tombstones as f64 / records as f64 >= self.tombstone_ratio_threshold
    }

    /// Merge every current segment into one
    ///
    /// The selection always starts at the oldest segment, so no older value
    /// can hide beneath a tombstone and tombstones are dropped. Returns the
    /// published output, or `None` when there was nothing to do or `cancel`
    /// was raised before publish (inputs are left untouched in that case).
    pub fn compact(&self, cancel: &AtomicBool) -> Result<Option<Arc<Segment>>> {
        let _guard = self.compaction_lock.lock();

        let inputs = self.snapshot();
        let tombstones: u64 = inputs.iter().map(|s| s.tombstone_count()).sum();
        if inputs.is_empty() || (inputs.len() == 1 && tombstones == 0) {
            return Ok(None);
        }

        let min_generation = inputs.iter().map(|s| s.min_generation()).min().unwrap_or(0);
        let max_generation = inputs.iter().map(|s| s.max_generation()).max().unwrap_or(0);

        let mut sources: Vec<(Priority, RecordSource)> = Vec::with_capacity(inputs.len());
        for segment in inputs.iter() {
            let cursor = segment.seek_ceiling(None)?;
            sources.push((Priority::disk(segment.max_generation()), Box::new(cursor)));
        }
        let merged = MergeIterator::new(sources, Direction::Ascending);

        let path = self.segment_path(min_generation, max_generation, self.allocate_generation());
        let mut builder =
            SegmentBuilder::new(&path, min_generation, max_generation, self.index_interval)?;
        for (n, record) in merged.enumerate() {
            if n as u64 % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::SeqCst) {
                tracing::info!("Compaction of generations {}..={} cancelled", min_generation, max_generation);
                builder.abandon();
                return Ok(None);
            }
            builder.add(&record?)?;
        }
        if cancel.load(Ordering::SeqCst) {
            builder.abandon();
            return Ok(None);
        }
        let meta = builder.finish()?;

        let output = Arc::new(Segment::open(&meta.path)?);
        self.publish(&inputs, Arc::clone(&output));
        for input in inputs.iter() {
            input.mark_obsolete();
        }

        tracing::debug!(
            "Compacted {} segment(s) into {} ({} records, {} tombstones dropped)",
            inputs.len(),
            meta.path.display(),
            meta.record_count,
            tombstones
        );

        Ok(Some(output))
    }

    /// Replace `removed` with `added` in one atomic list swap
    fn publish(&self, removed: &[Arc<Segment>], added: Arc<Segment>) {
        let mut segments = self.segments.write();
        let mut next: Vec<Arc<Segment>> = segments
            .iter()
            .filter(|s| !removed.iter().any(|r| Arc::ptr_eq(r, s)))
            .cloned()
            .collect();
        let position = next.partition_point(|s| s.max_generation() < added.max_generation());
        next.insert(position, added);
        *segments = Arc::new(next);
    }

    /// Get the number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get the next generation (for testing/debugging)
    pub fn next_generation(&self) -> u64 {
        self.next_generation.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Generate the file path for a segment covering `min..=max`
    ///
    /// `file_id` keeps names unique when a compaction output has the same
    /// span as one of its inputs.
    fn segment_path(&self, min_generation: u64, max_generation: u64, file_id: u64) -> PathBuf {
        Self::segment_path_with_dir(&self.data_dir, min_generation, max_generation, file_id)
    }

    /// Generate segment path given a directory, generation span and file id
    pub fn segment_path_with_dir(
        dir: &Path,
        min_generation: u64,
        max_generation: u64,
        file_id: u64,
    ) -> PathBuf {
        dir.join(format!(
            "segment_{:012}_{:012}_{:012}.{}",
            min_generation, max_generation, file_id, SEGMENT_EXTENSION
        ))
    }

    /// Parse generation span and file id from a file name
    /// "segment_000000000002_000000000005_000000000007.seg" → Some((2, 5, 7))
    fn parse_segment_name(path: &Path) -> Option<(u64, u64, u64)> {
        let name = path.file_stem()?.to_string_lossy();
        let mut parts = name.strip_prefix("segment_")?.splitn(3, '_');
        let min = parts.next()?.parse().ok()?;
        let max = parts.next()?.parse().ok()?;
        let file_id = parts.next()?.parse().ok()?;
        Some((min, max, file_id))
    }
}
