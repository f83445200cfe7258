//! Segment Reader
//!
//! Opens segment files, verifies them, and keeps the sparse index in memory
//! for O(log n) positioning.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DaoError, Result};
use crate::range::{Direction, KeyRange};
use crate::record::Record;

use super::cursor::{DescendingCursor, SegmentCursor};
use super::{FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// One sparse index entry: first key of a block and its file offset
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: Bytes,
    pub offset: u64,
}

/// An open, verified, immutable segment
///
/// Handles are shared as `Arc<Segment>`. Marking a segment obsolete removes
/// its file once the last handle (including open cursors) is dropped.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    min_generation: u64,
    max_generation: u64,
    record_count: u64,
    tombstone_count: u64,
    /// Sparse index, ascending by key
    index: Vec<IndexEntry>,
    /// Data block ends where the index block starts
    data_end: u64,
    file_size: u64,
    obsolete: AtomicBool,
}

impl Segment {
    /// Open a segment for reading
    ///
    /// Validates header, footer and all four checksums, then loads the
    /// sparse index into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(DaoError::corrupt(
                path,
                format!("file too small ({} bytes)", file_size),
            ));
        }

        // Read and validate header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(DaoError::corrupt(
                path,
                format!("invalid magic {:?}", &header[0..4]),
            ));
        }

        let version = le_u16(&header[4..6]);
        if version != VERSION {
            return Err(DaoError::corrupt(
                path,
                format!("unsupported version {}", version),
            ));
        }

        let min_generation = le_u64(&header[6..14]);
        let max_generation = le_u64(&header[14..22]);
        let record_count = le_u64(&header[22..30]);
        let tombstone_count = le_u64(&header[30..38]);

        // Read footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;

        let footer_crc = le_u32(&footer[24..28]);
        if crc32fast::hash(&footer[..24]) != footer_crc {
            return Err(DaoError::corrupt(path, "footer checksum mismatch"));
        }

        let index_offset = le_u64(&footer[0..8]);
        let index_count = le_u32(&footer[8..12]) as usize;
        let header_crc = le_u32(&footer[12..16]);
        let data_crc = le_u32(&footer[16..20]);
        let index_crc = le_u32(&footer[20..24]);

        if crc32fast::hash(&header) != header_crc {
            return Err(DaoError::corrupt(path, "header checksum mismatch"));
        }
        if min_generation > max_generation {
            return Err(DaoError::corrupt(
                path,
                format!(
                    "generation span {}..={} is inverted",
                    min_generation, max_generation
                ),
            ));
        }
        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(DaoError::corrupt(
                path,
                format!("index offset {} out of bounds", index_offset),
            ));
        }

        // Load index into memory
        file.seek(SeekFrom::Start(index_offset))?;
        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let mut index_data = vec![0u8; index_block_size as usize];
        file.read_exact(&mut index_data)?;

        if crc32fast::hash(&index_data) != index_crc {
            return Err(DaoError::corrupt(path, "index checksum mismatch"));
        }

        let index = parse_index(&index_data, index_count, index_offset, path)?;

        // Verify the data block in one streaming pass
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut data = BufReader::new(file).take(index_offset - HEADER_SIZE);
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = data.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        if hasher.finalize() != data_crc {
            return Err(DaoError::corrupt(path, "data checksum mismatch"));
        }

        if record_count > 0 && index.is_empty() {
            return Err(DaoError::corrupt(path, "records present but index empty"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            min_generation,
            max_generation,
            record_count,
            tombstone_count,
            index,
            data_end: index_offset,
            file_size,
            obsolete: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Forward cursor at the first record with key >= `key` (start if `None`)
    pub fn seek_ceiling(self: &Arc<Self>, key: Option<&[u8]>) -> Result<SegmentCursor> {
        let mut cursor = SegmentCursor::new(Arc::clone(self))?;
        cursor.seek(key)?;
        Ok(cursor)
    }

    /// Backward cursor at the greatest record with key < `bound` (last
    /// record if `None`)
    pub fn seek_floor_descending(self: &Arc<Self>, bound: Option<&[u8]>) -> Result<DescendingCursor> {
        let mut cursor = DescendingCursor::new(Arc::clone(self))?;
        cursor.seek(bound)?;
        Ok(cursor)
    }

    /// Records of `range` in `direction`, as a boxed source for merging
    pub fn scan(
        self: &Arc<Self>,
        range: &KeyRange,
        direction: Direction,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + Send>> {
        Ok(match direction {
            Direction::Ascending => Box::new(
                self.seek_ceiling(range.from())?
                    .with_upper_bound(range.to().map(Bytes::copy_from_slice)),
            ),
            Direction::Descending => Box::new(
                self.seek_floor_descending(range.to())?
                    .with_lower_bound(range.from().map(Bytes::copy_from_slice)),
            ),
        })
    }

    // =========================================================================
    // Index Lookups
    // =========================================================================

    /// Offset of the block that may hold the first key >= `key`
    pub(crate) fn ceiling_block_offset(&self, key: Option<&[u8]>) -> u64 {
        let Some(key) = key else {
            return super::HEADER_SIZE;
        };
        let idx = self.index.partition_point(|e| e.key.as_ref() <= key);
        if idx == 0 {
            super::HEADER_SIZE
        } else {
            self.index[idx - 1].offset
        }
    }

    /// Index of the last block holding any key < `bound`
    pub(crate) fn floor_block(&self, bound: Option<&[u8]>) -> Option<usize> {
        let count = match bound {
            None => self.index.len(),
            Some(bound) => self.index.partition_point(|e| e.key.as_ref() < bound),
        };
        count.checked_sub(1)
    }

    /// Byte range `[start, end)` of block `block`
    pub(crate) fn block_span(&self, block: usize) -> (u64, u64) {
        let start = self.index[block].offset;
        let end = self
            .index
            .get(block + 1)
            .map_or(self.data_end, |next| next.offset);
        (start, end)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Delete the file once no handle refers to this segment
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_generation(&self) -> u64 {
        self.min_generation
    }

    /// Priority of this segment's records
    pub fn max_generation(&self) -> u64 {
        self.max_generation
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn tombstone_count(&self) -> u64 {
        self.tombstone_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Smallest key in this segment
    pub fn min_key(&self) -> Option<&[u8]> {
        self.index.first().map(|e| e.key.as_ref())
    }

    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed obsolete segment {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove obsolete segment {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Parse index entries: [key_len(4)][offset(8)][key]
fn parse_index(data: &[u8], count: usize, data_end: u64, path: &Path) -> Result<Vec<IndexEntry>> {
    // Every entry takes at least 12 bytes; a larger count is not trusted
    if count > data.len() / 12 {
        return Err(DaoError::corrupt(
            path,
            format!("index count {} exceeds index block of {} bytes", count, data.len()),
        ));
    }
    let mut index: Vec<IndexEntry> = Vec::with_capacity(count);
    let mut pos = 0;

    while pos < data.len() {
        if pos + 12 > data.len() {
            return Err(DaoError::corrupt(path, "truncated index entry"));
        }
        let key_len = le_u32(&data[pos..pos + 4]) as usize;
        let offset = le_u64(&data[pos + 4..pos + 12]);
        pos += 12;

        if pos + key_len > data.len() {
            return Err(DaoError::corrupt(path, "truncated index key"));
        }
        let key = Bytes::copy_from_slice(&data[pos..pos + key_len]);
        pos += key_len;

        if offset < HEADER_SIZE || offset >= data_end {
            return Err(DaoError::corrupt(
                path,
                format!("index offset {} outside data block", offset),
            ));
        }
        if let Some(prev) = index.last() {
            if prev.key >= key || prev.offset >= offset {
                return Err(DaoError::corrupt(path, "index entries out of order"));
            }
        }

        index.push(IndexEntry { key, offset });
    }

    if index.len() != count {
        return Err(DaoError::corrupt(
            path,
            format!("index has {} entries, footer says {}", index.len(), count),
        ));
    }

    Ok(index)
}

fn le_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(bytes);
    u16::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
