//! Segment Module
//!
//! Sorted run - immutable on-disk sorted record storage.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (38 bytes)                                            │
//! │   Magic: "LSMD" (4) | Version: u16 (2)                       │
//! │   MinGeneration: u64 (8) | MaxGeneration: u64 (8)            │
//! │   RecordCount: u64 (8) | TombstoneCount: u64 (8)             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                        │
//! │   [KeyLen: u32][Key][Flag: u8][ValLen: u32][Value]           │
//! │   ... repeated for each record, ascending key order ...      │
//! │   (Flag = 1 means tombstone, no ValLen/Value follow)         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index Block (variable, sparse)                               │
//! │   [KeyLen: u32][Offset: u64][Key]                            │
//! │   ... one per `index_interval` records, first always ...     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Footer (28 bytes)                                            │
//! │   IndexOffset: u64 | IndexCount: u32 | HeaderCRC: u32        │
//! │   DataCRC: u32 | IndexCRC: u32 | FooterCRC: u32              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Files are written under a `.tmp` name and
//! renamed into place once complete, so a segment is either fully present or
//! absent.

mod builder;
mod cursor;
mod reader;

use std::io::Read;
use std::path::Path;

use bytes::Bytes;

use crate::error::{DaoError, Result};
use crate::record::Record;

pub use builder::{SegmentBuilder, SegmentMeta};
pub use cursor::{DescendingCursor, SegmentCursor};
pub use reader::{IndexEntry, Segment};

// =============================================================================
// Shared Constants (used by builder, reader, cursors)
// =============================================================================

/// Magic bytes identifying a segment file
pub(crate) const MAGIC: &[u8; 4] = b"LSMD";

/// Current segment format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + MinGen (8) + MaxGen (8) + Count (8) + Tombstones (8)
pub(crate) const HEADER_SIZE: u64 = 38;

/// Footer size: IndexOffset (8) + IndexCount (4) + 4 × CRC (4)
///
/// The last CRC covers the footer bytes before it.
pub(crate) const FOOTER_SIZE: u64 = 28;

pub(crate) const FLAG_VALUE: u8 = 0;
pub(crate) const FLAG_TOMBSTONE: u8 = 1;

/// Suffix of a finished segment file
pub const SEGMENT_EXTENSION: &str = "seg";

/// Suffix appended while a segment is being written
pub const TEMP_EXTENSION: &str = "tmp";

// =============================================================================
// Record Encoding
// =============================================================================

pub(crate) fn encode_record(record: &Record, out: &mut Vec<u8>) {
    out.extend_from_slice(&(record.key().len() as u32).to_le_bytes());
    out.extend_from_slice(record.key());
    match record.value() {
        Some(value) => {
            out.push(FLAG_VALUE);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        None => out.push(FLAG_TOMBSTONE),
    }
}

/// Read one record from `reader`, which holds at most `remaining` data bytes.
///
/// Returns the record and the number of bytes consumed. Lengths that run
/// past the data block or an unknown flag are reported as corruption.
pub(crate) fn read_record<R: Read>(
    reader: &mut R,
    remaining: u64,
    path: &Path,
) -> Result<(Record, u64)> {
    let key_len = read_u32(reader, path)? as u64;
    let mut consumed = 4 + key_len + 1;
    if consumed > remaining {
        return Err(DaoError::corrupt(path, "record key runs past data block"));
    }
    let key = read_bytes(reader, key_len as usize, path)?;

    let mut flag = [0u8; 1];
    read_exact(reader, &mut flag, path)?;

    let value = match flag[0] {
        FLAG_VALUE => {
            if consumed + 4 > remaining {
                return Err(DaoError::corrupt(path, "record header runs past data block"));
            }
            let val_len = read_u32(reader, path)? as u64;
            consumed += 4 + val_len;
            if consumed > remaining {
                return Err(DaoError::corrupt(path, "record value runs past data block"));
            }
            Some(read_bytes(reader, val_len as usize, path)?)
        }
        FLAG_TOMBSTONE => None,
        other => {
            return Err(DaoError::corrupt(
                path,
                format!("unknown record flag {}", other),
            ))
        }
    };

    Ok((Record::from_parts(key, value), consumed))
}

/// Decode one record from an in-memory block without copying payloads
pub(crate) fn decode_record(block: &Bytes, pos: usize, path: &Path) -> Result<(Record, usize)> {
    let take = |start: usize, len: usize| -> Result<Bytes> {
        if start + len > block.len() {
            return Err(DaoError::corrupt(path, "record runs past block end"));
        }
        Ok(block.slice(start..start + len))
    };
    let le_u32 = |start: usize| -> Result<usize> {
        let raw = take(start, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&raw);
        Ok(u32::from_le_bytes(buf) as usize)
    };

    let key_len = le_u32(pos)?;
    let key = take(pos + 4, key_len)?;
    let flag_pos = pos + 4 + key_len;
    let flag = take(flag_pos, 1)?[0];

    match flag {
        FLAG_VALUE => {
            let val_len = le_u32(flag_pos + 1)?;
            let value = take(flag_pos + 5, val_len)?;
            Ok((Record::from_parts(key, Some(value)), flag_pos + 5 + val_len))
        }
        FLAG_TOMBSTONE => Ok((Record::from_parts(key, None), flag_pos + 1)),
        other => Err(DaoError::corrupt(
            path,
            format!("unknown record flag {}", other),
        )),
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], path: &Path) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => DaoError::corrupt(path, "unexpected end of file"),
        _ => DaoError::Io(e),
    })
}

fn read_u32<R: Read>(reader: &mut R, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, path)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_bytes<R: Read>(reader: &mut R, len: usize, path: &Path) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf, path)?;
    Ok(Bytes::from(buf))
}
