//! Engine Module
//!
//! The storage engine facade that coordinates all components.
//!
//! ## Responsibilities
//! - Route writes to the live memtable
//! - Freeze full memtables and hand them to the flush worker
//! - Build merged, snapshot-isolated range scans
//! - Schedule compaction and shut everything down cleanly

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::DaoConfig;
use crate::error::{DaoError, Result};
use crate::memtable::MemTable;
use crate::merge::{MergeIterator, Priority, RecordSource};
use crate::range::{Direction, KeyRange};
use crate::record::{self, Record};
use crate::storage::SegmentManager;

/// The main storage engine
///
/// ## Concurrency Model
///
/// - **Writes** (upsert): hold the memtable-set lock shared and the live
///   memtable's map lock for the insertion only. Crossing the flush
///   threshold swaps in a fresh memtable under the exclusive lock and
///   queues the old one; writers never wait for disk I/O.
///
/// - **Reads** (range): clone the memtable set and the segment list (two
///   `Arc` clones), then merge without holding any lock.
///
/// - **Flush**: one background thread, fed in order through a channel.
///   A frozen memtable stays readable until its segment is published.
///
/// - **Compaction**: one background thread; at most one compaction runs
///   at a time.
pub struct Engine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// State shared with the background workers
struct EngineInner {
    config: DaoConfig,
    storage: SegmentManager,
    memtables: RwLock<Arc<MemTableSet>>,
    flush_tx: Sender<FlushTask>,
    compaction_tx: Sender<CompactionTask>,
    closed: AtomicBool,
    compaction_scheduled: AtomicBool,
    cancel_compaction: AtomicBool,
    read_only: AtomicBool,
    /// First unrecoverable background failure
    failure: Mutex<Option<String>>,
}

/// Live memtable plus memtables waiting for flush (oldest first)
struct MemTableSet {
    live: Arc<MemTable>,
    frozen: Vec<Arc<MemTable>>,
}

enum FlushTask {
    Flush(Arc<MemTable>),
    /// Reply once every earlier task is done
    Barrier(Sender<Result<()>>),
    Shutdown,
}

enum CompactionTask {
    Compact,
    Shutdown,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate config and open/create the data directory
    /// 2. Recover existing segments
    /// 3. Start with an empty memtable
    /// 4. Spawn the flush and compaction workers
    pub fn open(config: DaoConfig) -> Result<Self> {
        config.validate()?;

        let storage = SegmentManager::open(&config)?;
        let live = Arc::new(MemTable::new(storage.allocate_generation()));

        let (flush_tx, flush_rx) = channel::unbounded();
        let (compaction_tx, compaction_rx) = channel::unbounded();

        let inner = Arc::new(EngineInner {
            config,
            storage,
            memtables: RwLock::new(Arc::new(MemTableSet {
                live,
                frozen: Vec::new(),
            })),
            flush_tx,
            compaction_tx,
            closed: AtomicBool::new(false),
            compaction_scheduled: AtomicBool::new(false),
            cancel_compaction: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let flush_worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("lsmdao-flush".to_string())
                .spawn(move || inner.run_flush_worker(flush_rx))?
        };
        let compaction_worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("lsmdao-compaction".to_string())
                .spawn(move || inner.run_compaction_worker(compaction_rx))?
        };

        tracing::info!(
            "Engine opened at {} with {} segment(s)",
            inner.config.data_dir.display(),
            inner.storage.segment_count()
        );

        if inner.storage.needs_compaction() {
            inner.schedule_compaction();
        }

        Ok(Self {
            inner,
            workers: Mutex::new(vec![flush_worker, compaction_worker]),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(DaoConfig::new(path))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or replace a record (a tombstone deletes its key)
    ///
    /// May queue the live memtable for flushing, but never waits for it.
    pub fn upsert(&self, record: Record) -> Result<()> {
        let inner = &self.inner;

        let full_generation = {
            let tables = inner.memtables.read();
            inner.ensure_writable()?;
            let size = tables.live.upsert(record);
            (size >= inner.config.flush_threshold_bytes).then(|| tables.live.generation())
        };

        if let Some(generation) = full_generation {
            let mut tables = inner.memtables.write();
            inner.rotate_locked(&mut tables, Some(generation))?;
        }

        Ok(())
    }

    /// Put a key-value pair
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.upsert(Record::of(key, value))
    }

    /// Delete a key (writes a tombstone)
    pub fn delete(&self, key: impl Into<Bytes>) -> Result<()> {
        self.upsert(Record::tombstone(key))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Live records with `from <= key < to`, ascending
    ///
    /// `None` bounds are unbounded. Fails with `InvalidRange` if `from > to`.
    pub fn range(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<MergeIterator> {
        self.scan(from, to, Direction::Ascending)
    }

    /// Live records with `from <= key < to`, descending
    pub fn descending_range(
        &self,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
    ) -> Result<MergeIterator> {
        self.scan(from, to, Direction::Descending)
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let upper = record::next_key(key);
        match self.range(Some(key), Some(&upper[..]))?.next() {
            Some(Ok(found)) => Ok(found.into_parts().1),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Immediate successor of `key`, for turning an inclusive upper bound
    /// into an exclusive one
    pub fn next_key(key: &[u8]) -> Bytes {
        record::next_key(key)
    }

    fn scan(
        &self,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        direction: Direction,
    ) -> Result<MergeIterator> {
        self.inner.ensure_open()?;
        let range = KeyRange::new(
            from.map(Bytes::copy_from_slice),
            to.map(Bytes::copy_from_slice),
        )?;

        // Memtables first: a memtable retired after this point already has
        // its segment in the list taken below
        let tables = Arc::clone(&self.inner.memtables.read());
        let segments = self.inner.storage.snapshot();

        let mut sources: Vec<(Priority, RecordSource)> =
            Vec::with_capacity(1 + tables.frozen.len() + segments.len());

        for memtable in std::iter::once(&tables.live).chain(tables.frozen.iter()) {
            let snapshot = memtable.snapshot_range(&range, direction);
            if !snapshot.is_empty() {
                sources.push((
                    Priority::memory(memtable.generation()),
                    Box::new(snapshot.map(Ok::<Record, DaoError>)),
                ));
            }
        }

        for segment in segments.iter().filter(|s| !s.is_empty()) {
            sources.push((
                Priority::disk(segment.max_generation()),
                segment.scan(&range, direction)?,
            ));
        }

        Ok(MergeIterator::new(sources, direction))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flush memtable to disk and wait for it
    ///
    /// Also waits for every memtable queued earlier.
    pub fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let (done_tx, done_rx) = channel::bounded(1);
        {
            // Both tasks are queued before close() can queue Shutdown
            let mut tables = inner.memtables.write();
            inner.ensure_writable()?;
            inner.rotate_locked(&mut tables, None)?;
            inner
                .flush_tx
                .send(FlushTask::Barrier(done_tx))
                .map_err(|_| DaoError::ClosedEngine)?;
        }
        done_rx.recv().map_err(|_| DaoError::ClosedEngine)?
    }

    /// Run a compaction now, in the calling thread
    ///
    /// Returns whether a new segment was published.
    pub fn compact(&self) -> Result<bool> {
        self.inner.ensure_writable()?;
        let output = self.inner.storage.compact(&self.inner.cancel_compaction)?;
        Ok(output.is_some())
    }

    /// Close the engine gracefully
    ///
    /// Flushes the live memtable, waits for every queued flush, cancels
    /// compaction, and joins the workers. Reports a background failure if
    /// one made the engine read-only.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut tables = inner.memtables.write();
            if inner.closed.load(Ordering::SeqCst) {
                return Err(DaoError::ClosedEngine);
            }
            // Every memtable frozen earlier was queued under this lock, so
            // Shutdown lands behind all of them
            if let Err(e) = inner.rotate_locked(&mut tables, None) {
                tracing::error!("Failed to queue final flush: {}", e);
            }
            inner.closed.store(true, Ordering::SeqCst);
            let _ = inner.flush_tx.send(FlushTask::Shutdown);
        }

        inner.cancel_compaction.store(true, Ordering::SeqCst);
        let _ = inner.compaction_tx.send(CompactionTask::Shutdown);

        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::error!("Background worker panicked during shutdown");
            }
        }

        match inner.failure.lock().clone() {
            Some(reason) => Err(DaoError::ReadOnly(reason)),
            None => {
                tracing::info!("Engine at {} closed", inner.config.data_dir.display());
                Ok(())
            }
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// Get the configuration
    pub fn config(&self) -> &DaoConfig {
        &self.inner.config
    }

    /// Get the live memtable size
    pub fn memtable_size(&self) -> usize {
        self.inner.memtables.read().live.size()
    }

    /// Get the live memtable entry count
    pub fn memtable_entry_count(&self) -> usize {
        self.inner.memtables.read().live.entry_count()
    }

    /// Memtables frozen but not yet flushed
    pub fn frozen_memtable_count(&self) -> usize {
        self.inner.memtables.read().frozen.len()
    }

    /// Get the number of segments
    pub fn segment_count(&self) -> usize {
        self.inner.storage.segment_count()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            tracing::error!("Failed to close engine on drop: {}", e);
        }
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DaoError::ClosedEngine);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only.load(Ordering::SeqCst) {
            let reason = self.failure.lock().clone().unwrap_or_default();
            return Err(DaoError::ReadOnly(reason));
        }
        Ok(())
    }

    /// Freeze the live memtable, install an empty one and queue the frozen
    /// one for flushing.
    ///
    /// Must run under the memtable-set write lock: the flush task is queued
    /// before the lock is released, so no memtable is frozen without being
    /// ahead of a later Shutdown. With `expected`, only the memtable of that
    /// generation is frozen, so writers racing past the threshold freeze it
    /// once.
    fn rotate_locked(&self, tables: &mut Arc<MemTableSet>, expected: Option<u64>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if expected.is_some_and(|g| g != tables.live.generation()) {
            return Ok(());
        }
        if tables.live.is_empty() {
            return Ok(());
        }

        let fresh = Arc::new(MemTable::new(self.storage.allocate_generation()));
        let old = Arc::clone(&tables.live);
        old.freeze();

        let mut frozen = tables.frozen.clone();
        frozen.push(Arc::clone(&old));
        *tables = Arc::new(MemTableSet { live: fresh, frozen });

        tracing::debug!(
            "Froze memtable generation {} ({} bytes)",
            old.generation(),
            old.size()
        );
        self.flush_tx
            .send(FlushTask::Flush(old))
            .map_err(|_| DaoError::ClosedEngine)
    }

    fn schedule_compaction(&self) {
        if self.compaction_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.compaction_tx.send(CompactionTask::Compact).is_err() {
            self.compaction_scheduled.store(false, Ordering::SeqCst);
        }
    }

    // =========================================================================
    // Background Workers
    // =========================================================================

    fn run_flush_worker(self: Arc<Self>, tasks: Receiver<FlushTask>) {
        for task in tasks {
            match task {
                FlushTask::Flush(memtable) => self.flush_memtable(&memtable),
                FlushTask::Barrier(done) => {
                    let status = match self.failure.lock().clone() {
                        Some(reason) => Err(DaoError::ReadOnly(reason)),
                        None => Ok(()),
                    };
                    let _ = done.send(status);
                }
                FlushTask::Shutdown => break,
            }
        }
        tracing::debug!("Flush worker stopped");
    }

    fn flush_memtable(&self, memtable: &Arc<MemTable>) {
        if self.read_only.load(Ordering::SeqCst) {
            return;
        }

        match self.with_retries("flush", || self.storage.flush(memtable)) {
            Ok(_) => {
                self.retire(memtable);
                if self.storage.needs_compaction() {
                    self.schedule_compaction();
                }
            }
            Err(e) => self.fail(format!(
                "flush of generation {} failed: {}",
                memtable.generation(),
                e
            )),
        }
    }

    /// Drop a flushed memtable from the read set
    fn retire(&self, memtable: &Arc<MemTable>) {
        let mut tables = self.memtables.write();
        let frozen = tables
            .frozen
            .iter()
            .filter(|m| !Arc::ptr_eq(m, memtable))
            .cloned()
            .collect();
        *tables = Arc::new(MemTableSet {
            live: Arc::clone(&tables.live),
            frozen,
        });
    }

    fn run_compaction_worker(self: Arc<Self>, tasks: Receiver<CompactionTask>) {
        for task in tasks {
            match task {
                CompactionTask::Compact => {
                    self.compaction_scheduled.store(false, Ordering::SeqCst);
                    if self.cancel_compaction.load(Ordering::SeqCst)
                        || self.read_only.load(Ordering::SeqCst)
                    {
                        continue;
                    }
                    let result = self.with_retries("compaction", || {
                        self.storage.compact(&self.cancel_compaction)
                    });
                    if let Err(e) = result {
                        self.fail(format!("compaction failed: {}", e));
                    }
                }
                CompactionTask::Shutdown => break,
            }
        }
        tracing::debug!("Compaction worker stopped");
    }

    /// Run `op`, retrying with linear backoff
    fn with_retries<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.config.max_background_retries;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    tracing::warn!("{} attempt {}/{} failed: {}", what, attempt, attempts, e);
                    thread::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * attempt as u64,
                    ));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Switch to read-only after an unrecoverable background failure
    fn fail(&self, reason: String) {
        tracing::error!("Engine is now read-only: {}", reason);
        self.failure.lock().get_or_insert(reason);
        self.read_only.store(true, Ordering::SeqCst);
    }
}
