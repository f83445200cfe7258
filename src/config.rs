//! Configuration for lsmdao
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DaoError, Result};

/// Main configuration for an engine instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaoConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding every segment file of this engine
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── segment_000000000001_000000000001_000000000001.seg
    ///     └── segment_000000000002_000000000005_000000000009.seg  (compaction output)
    /// Names are `segment_<min generation>_<max generation>_<file id>.seg`
    pub data_dir: PathBuf,

    /// One sparse index entry is written every `index_interval` records
    pub index_interval: usize,

    /// Rename corrupt segments to `*.corrupt` on startup instead of
    /// refusing to open
    pub quarantine_corrupt_segments: bool,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Max size of memtable before flush (in bytes)
    pub flush_threshold_bytes: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Compaction starts once more than this many segments exist
    pub max_segments: usize,

    /// Compaction starts once tombstones make up at least this share of
    /// all on-disk records
    pub tombstone_ratio_threshold: f64,

    // -------------------------------------------------------------------------
    // Background Failure Policy
    // -------------------------------------------------------------------------
    /// Attempts for a flush or compaction before the engine turns read-only
    pub max_background_retries: u32,

    /// Base delay between attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
}

impl Default for DaoConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./lsmdao_data"),
            index_interval: 16,
            quarantine_corrupt_segments: false,
            flush_threshold_bytes: 4 * 1024 * 1024, // 4 MB
            max_segments: 8,
            tombstone_ratio_threshold: 0.5,
            max_background_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl DaoConfig {
    /// Create a new config builder
    pub fn builder() -> DaoConfigBuilder {
        DaoConfigBuilder::default()
    }

    /// Default config rooted at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::builder().data_dir(path).build()
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold_bytes == 0 {
            return Err(DaoError::Config(
                "flush_threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if self.index_interval == 0 {
            return Err(DaoError::Config(
                "index_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_segments == 0 {
            return Err(DaoError::Config(
                "max_segments must be greater than zero".to_string(),
            ));
        }
        if !(self.tombstone_ratio_threshold > 0.0 && self.tombstone_ratio_threshold <= 1.0) {
            return Err(DaoError::Config(format!(
                "tombstone_ratio_threshold must be in (0, 1], got {}",
                self.tombstone_ratio_threshold
            )));
        }
        if self.max_background_retries == 0 {
            return Err(DaoError::Config(
                "max_background_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for DaoConfig
#[derive(Default)]
pub struct DaoConfigBuilder {
    config: DaoConfig,
}

impl DaoConfigBuilder {
    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the memtable flush threshold (in bytes)
    pub fn flush_threshold_bytes(mut self, size: usize) -> Self {
        self.config.flush_threshold_bytes = size;
        self
    }

    /// Set the segment count that triggers compaction
    pub fn max_segments(mut self, count: usize) -> Self {
        self.config.max_segments = count;
        self
    }

    /// Set the tombstone share that triggers compaction
    pub fn tombstone_ratio_threshold(mut self, ratio: f64) -> Self {
        self.config.tombstone_ratio_threshold = ratio;
        self
    }

    /// Set the sparse index interval (records per index entry)
    pub fn index_interval(mut self, interval: usize) -> Self {
        self.config.index_interval = interval;
        self
    }

    /// Set how corrupt segments found on startup are handled
    pub fn quarantine_corrupt_segments(mut self, quarantine: bool) -> Self {
        self.config.quarantine_corrupt_segments = quarantine;
        self
    }

    /// Set the number of attempts for background flush/compaction
    pub fn max_background_retries(mut self, attempts: u32) -> Self {
        self.config.max_background_retries = attempts;
        self
    }

    /// Set the base retry backoff (in milliseconds)
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn build(self) -> DaoConfig {
        self.config
    }
}
