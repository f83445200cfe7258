//! Tests for segment files
//!
//! These tests verify:
//! - Segment creation, temp-file publish and metadata
//! - Ordered key enforcement in the builder
//! - Ascending and descending cursors, seeks and bounds
//! - Tombstone round trip
//! - Corruption detection
//! - Deferred removal of obsolete segments

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use lsmdao::storage::{Segment, SegmentBuilder, SegmentMeta};
use lsmdao::{DaoError, Direction, KeyRange, Record};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_segment() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.seg");
    (temp_dir, path)
}

fn key(i: usize) -> String {
    format!("key{:05}", i) // Zero-padded for lexicographic order
}

/// Create a segment with numbered records; every 7th is a tombstone
fn create_segment(path: &Path, count: usize, index_interval: usize) -> SegmentMeta {
    let mut builder = SegmentBuilder::new(path, 3, 3, index_interval).unwrap();
    for i in 0..count {
        let record = if i % 7 == 6 {
            Record::tombstone(key(i))
        } else {
            Record::of(key(i), format!("value{}", i))
        };
        builder.add(&record).unwrap();
    }
    builder.finish().unwrap()
}

fn open(path: &Path) -> Arc<Segment> {
    Arc::new(Segment::open(path).unwrap())
}

fn collect_keys(iter: impl Iterator<Item = lsmdao::Result<Record>>) -> Vec<String> {
    iter.map(|r| String::from_utf8(r.unwrap().key().to_vec()).unwrap())
        .collect()
}

// =============================================================================
// SegmentBuilder Tests
// =============================================================================

#[test]
fn test_builder_publishes_file() {
    let (temp, path) = setup_temp_segment();

    let meta = create_segment(&path, 20, 4);

    assert!(path.exists());
    assert_eq!(meta.record_count, 20);
    assert_eq!(meta.tombstone_count, 2);
    assert_eq!(meta.min_generation, 3);
    assert_eq!(meta.max_generation, 3);
    assert!(meta.file_size > 0);

    // No temp file left behind
    let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_builder_rejects_unsorted_keys() {
    let (_temp, path) = setup_temp_segment();

    let mut builder = SegmentBuilder::new(&path, 1, 1, 4).unwrap();
    builder.add(&Record::of("b", "1")).unwrap();

    let result = builder.add(&Record::of("a", "2"));
    assert!(matches!(result, Err(DaoError::Storage(_))));

    let result = builder.add(&Record::of("b", "3"));
    assert!(matches!(result, Err(DaoError::Storage(_))));
}

#[test]
fn test_builder_dropped_removes_temp_file() {
    let (temp, path) = setup_temp_segment();

    {
        let mut builder = SegmentBuilder::new(&path, 1, 1, 4).unwrap();
        builder.add(&Record::of("a", "1")).unwrap();
    }

    assert!(!path.exists());
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_builder_abandon_removes_temp_file() {
    let (temp, path) = setup_temp_segment();

    let mut builder = SegmentBuilder::new(&path, 1, 1, 4).unwrap();
    builder.add(&Record::of("a", "1")).unwrap();
    builder.abandon();

    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_empty_segment() {
    let (_temp, path) = setup_temp_segment();

    SegmentBuilder::new(&path, 1, 4, 4).unwrap().finish().unwrap();
    let segment = open(&path);

    assert!(segment.is_empty());
    assert_eq!(segment.min_generation(), 1);
    assert_eq!(segment.max_generation(), 4);
    assert!(segment.min_key().is_none());
    assert_eq!(segment.seek_ceiling(None).unwrap().count(), 0);
    assert_eq!(segment.seek_floor_descending(None).unwrap().count(), 0);
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_open_reads_metadata() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 50, 8);

    let segment = open(&path);

    assert_eq!(segment.record_count(), 50);
    assert_eq!(segment.tombstone_count(), 7);
    assert_eq!(segment.index().len(), 7); // ceil(50 / 8)
    assert_eq!(segment.min_key(), Some(key(0).as_bytes()));
}

#[test]
fn test_full_ascending_scan() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 50, 8);
    let segment = open(&path);

    let keys = collect_keys(segment.seek_ceiling(None).unwrap());

    let expected: Vec<String> = (0..50).map(key).collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_full_descending_scan() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 50, 8);
    let segment = open(&path);

    let keys = collect_keys(segment.seek_floor_descending(None).unwrap());

    let expected: Vec<String> = (0..50).rev().map(key).collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_tombstones_round_trip() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 14, 4);
    let segment = open(&path);

    let records: Vec<Record> = segment.seek_ceiling(None).unwrap().map(|r| r.unwrap()).collect();

    assert!(records[6].is_tombstone());
    assert!(records[13].is_tombstone());
    assert_eq!(records[5].value().unwrap().as_ref(), b"value5");
}

#[test]
fn test_seek_ceiling_positions() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 50, 8);
    let segment = open(&path);

    // Exact key inside a block
    let mut cursor = segment.seek_ceiling(Some(key(19).as_bytes())).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(19).as_bytes());

    // Between keys: "key00019a" sorts after key00019
    let mut cursor = segment.seek_ceiling(Some(b"key00019a".as_slice())).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(20).as_bytes());

    // Before everything
    let mut cursor = segment.seek_ceiling(Some(b"a".as_slice())).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(0).as_bytes());

    // After everything
    let mut cursor = segment.seek_ceiling(Some(b"z".as_slice())).unwrap();
    assert!(cursor.next().is_none());
}

#[test]
fn test_cursor_reseek() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 30, 4);
    let segment = open(&path);

    let mut cursor = segment.seek_ceiling(Some(key(25).as_bytes())).unwrap();
    assert_eq!(cursor.by_ref().count(), 5);
    assert!(cursor.next().is_none());

    cursor.seek(Some(key(10).as_bytes())).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(10).as_bytes());
}

#[test]
fn test_seek_floor_descending_positions() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 50, 8);
    let segment = open(&path);

    // Bound is exclusive
    let mut cursor = segment.seek_floor_descending(Some(key(16).as_bytes())).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(15).as_bytes());
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(14).as_bytes());

    // Bound at the first key yields nothing
    let mut cursor = segment.seek_floor_descending(Some(key(0).as_bytes())).unwrap();
    assert!(cursor.next().is_none());

    // Bound past the end starts at the last record
    let mut cursor = segment.seek_floor_descending(Some(b"z".as_slice())).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key().as_ref(), key(49).as_bytes());

    cursor.seek(Some(key(3).as_bytes())).unwrap();
    assert_eq!(collect_keys(cursor), vec![key(2), key(1), key(0)]);
}

#[test]
fn test_scan_respects_range_both_directions() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 50, 8);
    let segment = open(&path);

    let range = KeyRange::new(
        Some(Bytes::from(key(10))),
        Some(Bytes::from(key(21))),
    )
    .unwrap();

    let ascending = collect_keys(segment.scan(&range, Direction::Ascending).unwrap());
    let expected: Vec<String> = (10..21).map(key).collect();
    assert_eq!(ascending, expected);

    let descending = collect_keys(segment.scan(&range, Direction::Descending).unwrap());
    let expected: Vec<String> = (10..21).rev().map(key).collect();
    assert_eq!(descending, expected);
}

#[test]
fn test_index_interval_one() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 10, 1);
    let segment = open(&path);

    assert_eq!(segment.index().len(), 10);
    let keys = collect_keys(segment.seek_floor_descending(Some(key(5).as_bytes())).unwrap());
    assert_eq!(keys, vec![key(4), key(3), key(2), key(1), key(0)]);
}

#[test]
fn test_concurrent_cursors() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 40, 8);
    let segment = open(&path);

    let mut forward = segment.seek_ceiling(None).unwrap();
    let mut backward = segment.seek_floor_descending(None).unwrap();

    for i in 0..40 {
        assert_eq!(forward.next().unwrap().unwrap().key().as_ref(), key(i).as_bytes());
        assert_eq!(
            backward.next().unwrap().unwrap().key().as_ref(),
            key(39 - i).as_bytes()
        );
    }
}

// =============================================================================
// Corruption Tests
// =============================================================================

const FOOTER_LEN: usize = 28;

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
}

#[test]
fn test_corrupt_data_detected() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 20, 4);

    flip_byte(&path, 50); // Inside the data block

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

#[test]
fn test_corrupt_header_detected() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 20, 4);

    flip_byte(&path, 25); // Record count

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

#[test]
fn test_bad_magic_detected() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 5, 4);

    flip_byte(&path, 0);

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

/// Overwrite the footer's index count and re-sign the footer checksum
fn rewrite_index_count(path: &Path, count: u32) {
    let mut bytes = fs::read(path).unwrap();
    let footer = bytes.len() - FOOTER_LEN;
    bytes[footer + 8..footer + 12].copy_from_slice(&count.to_le_bytes());
    let crc = crc32fast::hash(&bytes[footer..footer + 24]);
    bytes[footer + 24..].copy_from_slice(&crc.to_le_bytes());
    fs::write(path, bytes).unwrap();
}

#[test]
fn test_corrupt_footer_detected() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 20, 4);
    let len = fs::metadata(&path).unwrap().len();

    flip_byte(&path, len - FOOTER_LEN as u64 + 9); // Index count

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

#[test]
fn test_footer_checksum_covers_every_field() {
    for field_offset in [0u64, 12, 16, 20, 24] {
        let (_temp, path) = setup_temp_segment();
        create_segment(&path, 20, 4);
        let len = fs::metadata(&path).unwrap().len();

        flip_byte(&path, len - FOOTER_LEN as u64 + field_offset);

        let result = Segment::open(&path);
        assert!(
            matches!(result, Err(DaoError::CorruptSegment { .. })),
            "footer byte {} not checked",
            field_offset
        );
    }
}

#[test]
fn test_huge_index_count_rejected_without_allocating() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 20, 4);

    rewrite_index_count(&path, u32::MAX);

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

#[test]
fn test_index_count_mismatch_detected() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 20, 4); // 5 index entries

    rewrite_index_count(&path, 6);

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

#[test]
fn test_corrupt_index_detected() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 20, 4);
    let len = fs::metadata(&path).unwrap().len();

    flip_byte(&path, len - FOOTER_LEN as u64 - 1); // Last byte of the last index key

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

#[test]
fn test_truncated_file_detected() {
    let (_temp, path) = setup_temp_segment();
    fs::write(&path, b"LSMD").unwrap();

    let result = Segment::open(&path);
    assert!(matches!(result, Err(DaoError::CorruptSegment { .. })));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_obsolete_segment_removed_after_last_handle() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 10, 4);
    let segment = open(&path);

    let cursor = segment.seek_ceiling(None).unwrap();
    segment.mark_obsolete();
    drop(segment);

    // The open cursor still holds a handle
    assert!(path.exists());
    assert_eq!(cursor.count(), 10);

    assert!(!path.exists());
}

#[test]
fn test_live_segment_kept_on_drop() {
    let (_temp, path) = setup_temp_segment();
    create_segment(&path, 10, 4);

    drop(open(&path));

    assert!(path.exists());
}
