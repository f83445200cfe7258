//! Storage Module
//!
//! Persistent storage layer: immutable sorted segments on disk.
//!
//! ## Responsibilities
//! - Persist memtables to disk in sorted format
//! - Efficient range positioning via a sparse index
//! - Background compaction that merges segments and drops tombstones
//! - Crash-safe publish (write temp file, fsync, rename)
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/
//!   ├── segment_<min>_<max>_<file>.seg   published segments
//!   ├── segment_<...>.seg.tmp            unpublished, deleted on startup
//!   └── segment_<...>.corrupt            quarantined, never read
//! ```

pub mod segment;
mod manager;

pub use manager::{SegmentList, SegmentManager};
pub use segment::{DescendingCursor, Segment, SegmentBuilder, SegmentCursor, SegmentMeta};
