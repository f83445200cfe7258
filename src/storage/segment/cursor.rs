//! Segment Cursors
//!
//! Lazy, re-seekable iteration over a segment in either direction.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DaoError, Result};
use crate::record::Record;

use super::reader::Segment;
use super::{decode_record, read_record};

/// Forward cursor over a segment in ascending key order
///
/// Holds its own file handle, so any number of cursors can read the same
/// segment concurrently.
pub struct SegmentCursor {
    segment: Arc<Segment>,
    reader: BufReader<File>,
    /// Offset of the next record to read
    offset: u64,
    /// Records below this key are skipped after a seek
    skip_below: Option<Bytes>,
    /// Exclusive upper bound; reaching it ends iteration
    upper: Option<Bytes>,
    done: bool,
}

impl SegmentCursor {
    pub(super) fn new(segment: Arc<Segment>) -> Result<Self> {
        let file = File::open(segment.path())?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: super::HEADER_SIZE,
            segment,
            skip_below: None,
            upper: None,
            done: false,
        })
    }

    /// Reposition at the first record with key >= `key` (start if `None`)
    pub fn seek(&mut self, key: Option<&[u8]>) -> Result<()> {
        self.offset = self.segment.ceiling_block_offset(key);
        self.reader.seek(SeekFrom::Start(self.offset))?;
        self.skip_below = key.map(Bytes::copy_from_slice);
        self.done = false;
        Ok(())
    }

    /// Stop before the first key >= `upper`
    pub fn with_upper_bound(mut self, upper: Option<Bytes>) -> Self {
        self.upper = upper;
        self
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Iterator for SegmentCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.offset >= self.segment.data_end() {
                self.done = true;
                return None;
            }

            let remaining = self.segment.data_end() - self.offset;
            let (record, consumed) =
                match read_record(&mut self.reader, remaining, self.segment.path()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
            self.offset += consumed;

            if let Some(skip) = &self.skip_below {
                if record.key() < skip {
                    continue;
                }
                self.skip_below = None;
            }

            if let Some(upper) = &self.upper {
                if record.key() >= upper {
                    self.done = true;
                    return None;
                }
            }

            return Some(Ok(record));
        }
    }
}

/// Backward cursor over a segment in descending key order
///
/// Walks the sparse index from the back, loading one block (the records
/// between two index entries) at a time and yielding it in reverse.
pub struct DescendingCursor {
    segment: Arc<Segment>,
    file: File,
    /// Next block to load, moving toward the front of the file
    pending_block: Option<usize>,
    /// Loaded records of the current block; yielded from the back
    buffer: Vec<Record>,
    /// Exclusive upper bound set by the last seek
    upper: Option<Bytes>,
    /// Inclusive lower bound; passing it ends iteration
    lower: Option<Bytes>,
    done: bool,
}

impl DescendingCursor {
    pub(super) fn new(segment: Arc<Segment>) -> Result<Self> {
        let file = File::open(segment.path())?;
        Ok(Self {
            segment,
            file,
            pending_block: None,
            buffer: Vec::new(),
            upper: None,
            lower: None,
            done: false,
        })
    }

    /// Reposition at the greatest record with key < `bound` (last record if
    /// `None`)
    pub fn seek(&mut self, bound: Option<&[u8]>) -> Result<()> {
        self.pending_block = self.segment.floor_block(bound);
        self.upper = bound.map(Bytes::copy_from_slice);
        self.buffer.clear();
        self.done = false;
        Ok(())
    }

    /// Stop after the last key >= `lower`
    pub fn with_lower_bound(mut self, lower: Option<Bytes>) -> Self {
        self.lower = lower;
        self
    }

    fn load_block(&mut self, block: usize) -> Result<()> {
        let (start, end) = self.segment.block_span(block);
        let path = self.segment.path();

        let mut raw = vec![0u8; (end - start) as usize];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut raw).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DaoError::corrupt(path, "block runs past end of file"),
            _ => DaoError::Io(e),
        })?;
        let raw = Bytes::from(raw);

        let mut pos = 0;
        while pos < raw.len() {
            let (record, next) = decode_record(&raw, pos, path)?;
            pos = next;
            if let Some(upper) = &self.upper {
                if record.key() >= upper {
                    break;
                }
            }
            self.buffer.push(record);
        }

        self.pending_block = block.checked_sub(1);
        Ok(())
    }
}

impl Iterator for DescendingCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(record) = self.buffer.pop() {
                if let Some(lower) = &self.lower {
                    if record.key() < lower {
                        self.done = true;
                        self.buffer.clear();
                        return None;
                    }
                }
                return Some(Ok(record));
            }

            let Some(block) = self.pending_block else {
                self.done = true;
                return None;
            };
            if let Err(e) = self.load_block(block) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
