//! # lsmdao
//!
//! An embedded log-structured-merge key-value engine with:
//! - Upserts and tombstone deletes of opaque binary keys and values
//! - Ordered range scans, ascending and descending
//! - Background flush of full memtables to immutable sorted segments
//! - Background compaction that merges segments and drops deleted keys
//! - Crash-safe segment publish and startup recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Engine (DAO)                            │
//! │        upsert · range · descending_range · close             │
//! └───────────┬──────────────────────────────┬──────────────────┘
//!             │ writes                        │ reads
//!             ▼                               ▼
//!   ┌──────────────────┐            ┌──────────────────┐
//!   │  Live MemTable   │            │  Merge Iterator  │
//!   └────────┬─────────┘            │  (k-way, newest  │
//!            │ freeze               │   wins)          │
//!            ▼                      └────────▲─────────┘
//!   ┌──────────────────┐  flush worker       │
//!   │ Frozen MemTables ├──────────┐   memtables + segments
//!   └──────────────────┘          ▼          │
//!                        ┌────────────────────┴─┐
//!                        │   Segment Manager    │◄── compaction worker
//!                        │  (sorted segments)   │
//!                        └──────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use lsmdao::{DaoConfig, Engine, Record};
//!
//! let engine = Engine::open(DaoConfig::new("./data"))?;
//! engine.upsert(Record::of("KEY_1", "VALUE_1"))?;
//! engine.upsert(Record::tombstone("KEY_2"))?;
//! for record in engine.range(None, None)? {
//!     let record = record?;
//!     println!("{:?} = {:?}", record.key(), record.value());
//! }
//! engine.close()?;
//! # Ok::<(), lsmdao::DaoError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod range;
pub mod memtable;
pub mod storage;
pub mod merge;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::DaoConfig;
pub use engine::Engine;
pub use error::{DaoError, Result};
pub use merge::MergeIterator;
pub use range::{Direction, KeyRange};
pub use record::{next_key, Record};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of lsmdao
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
