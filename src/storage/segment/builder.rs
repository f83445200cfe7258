//! Segment Builder
//!
//! Writes sorted records to a new segment file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{DaoError, Result};
use crate::record::Record;

use super::{encode_record, FOOTER_SIZE, HEADER_SIZE, MAGIC, TEMP_EXTENSION, VERSION};

/// Summary of a finished segment file
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// Path of the published file
    pub path: PathBuf,
    pub min_generation: u64,
    pub max_generation: u64,
    pub record_count: u64,
    pub tombstone_count: u64,
    /// File size in bytes
    pub file_size: u64,
}

/// Builder for creating new segments from sorted records
///
/// Records go to `<path>.tmp`; `finish()` renames the file into place. A
/// builder dropped before `finish()` deletes its temp file.
pub struct SegmentBuilder {
    /// Final (published) path
    path: PathBuf,
    temp_path: PathBuf,
    /// Buffered writer; `None` once `finish()` has started
    writer: Option<BufWriter<File>>,
    /// Set once the file has been renamed into place
    published: bool,
    min_generation: u64,
    max_generation: u64,
    index_interval: usize,
    record_count: u64,
    tombstone_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Sparse index: key → file offset of record
    index: Vec<(Vec<u8>, u64)>,
    last_key: Option<Vec<u8>>,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
    scratch: Vec<u8>,
}

impl SegmentBuilder {
    /// Create a builder for a segment covering `min_generation..=max_generation`
    ///
    /// Writes a placeholder header immediately; call `add()` in strictly
    /// ascending key order, then `finish()`.
    pub fn new(
        path: &Path,
        min_generation: u64,
        max_generation: u64,
        index_interval: usize,
    ) -> Result<Self> {
        let temp_path = temp_path_for(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&[0u8; HEADER_SIZE as usize])?;

        Ok(Self {
            path: path.to_path_buf(),
            temp_path,
            writer: Some(writer),
            published: false,
            min_generation,
            max_generation,
            index_interval: index_interval.max(1),
            record_count: 0,
            tombstone_count: 0,
            current_offset: HEADER_SIZE,
            index: Vec::new(),
            last_key: None,
            data_hasher: crc32fast::Hasher::new(),
            scratch: Vec::new(),
        })
    }

    /// Append a record; keys must be strictly ascending
    pub fn add(&mut self, record: &Record) -> Result<()> {
        if let Some(last) = &self.last_key {
            if record.key().as_ref() <= last.as_slice() {
                return Err(DaoError::Storage(format!(
                    "segment keys out of order: {:?} after {:?}",
                    record.key(),
                    last
                )));
            }
        }

        if self.record_count % self.index_interval as u64 == 0 {
            self.index.push((record.key().to_vec(), self.current_offset));
        }

        self.scratch.clear();
        encode_record(record, &mut self.scratch);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaoError::Storage("segment builder already finished".to_string()))?;
        writer.write_all(&self.scratch)?;
        self.data_hasher.update(&self.scratch);

        self.current_offset += self.scratch.len() as u64;
        self.record_count += 1;
        if record.is_tombstone() {
            self.tombstone_count += 1;
        }
        self.last_key = Some(record.key().to_vec());

        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Finish building: write index block and footer, sync, publish
    pub fn finish(mut self) -> Result<SegmentMeta> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| DaoError::Storage("segment builder already finished".to_string()))?;

        let index_offset = self.current_offset;

        // Index block: [key_len(4)][offset(8)][key] per sampled record
        let mut index_hasher = crc32fast::Hasher::new();
        for (key, offset) in &self.index {
            let mut entry = Vec::with_capacity(12 + key.len());
            entry.extend_from_slice(&(key.len() as u32).to_le_bytes());
            entry.extend_from_slice(&offset.to_le_bytes());
            entry.extend_from_slice(key);
            writer.write_all(&entry)?;
            index_hasher.update(&entry);
        }

        let header = self.header_bytes();
        let header_crc = crc32fast::hash(&header);
        let data_crc = self.data_hasher.clone().finalize();
        let index_crc = index_hasher.finalize();

        let mut footer = Vec::with_capacity(FOOTER_SIZE as usize);
        footer.extend_from_slice(&index_offset.to_le_bytes());
        footer.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        footer.extend_from_slice(&header_crc.to_le_bytes());
        footer.extend_from_slice(&data_crc.to_le_bytes());
        footer.extend_from_slice(&index_crc.to_le_bytes());
        let footer_crc = crc32fast::hash(&footer);
        footer.extend_from_slice(&footer_crc.to_le_bytes());
        writer.write_all(&footer)?;
        writer.flush()?;

        // Seek back and fill in the real header
        let mut file = writer
            .into_inner()
            .map_err(|e| DaoError::Storage(format!("Failed to flush segment: {}", e)))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        self.published = true;
        sync_dir(&self.path)?;

        Ok(SegmentMeta {
            path: self.path.clone(),
            min_generation: self.min_generation,
            max_generation: self.max_generation,
            record_count: self.record_count,
            tombstone_count: self.tombstone_count,
            file_size,
        })
    }

    /// Discard the partially written file
    pub fn abandon(mut self) {
        self.remove_temp();
    }

    fn header_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        header[6..14].copy_from_slice(&self.min_generation.to_le_bytes());
        header[14..22].copy_from_slice(&self.max_generation.to_le_bytes());
        header[22..30].copy_from_slice(&self.record_count.to_le_bytes());
        header[30..38].copy_from_slice(&self.tombstone_count.to_le_bytes());
        header
    }

    fn remove_temp(&mut self) {
        if self.published {
            return;
        }
        self.published = true;
        drop(self.writer.take());
        match fs::remove_file(&self.temp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove temp segment {}: {}",
                self.temp_path.display(),
                e
            ),
        }
    }
}

impl Drop for SegmentBuilder {
    fn drop(&mut self) {
        self.remove_temp();
    }
}

/// `segment_x.seg` → `segment_x.seg.tmp`
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(TEMP_EXTENSION);
    PathBuf::from(name)
}

/// Make a rename durable by syncing the parent directory
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
