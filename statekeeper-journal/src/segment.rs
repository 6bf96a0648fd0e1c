//! Journal segment files.
//!
//! The journal is a sequence of segment files named by a monotonically
//! increasing id. A new segment is started once the current one cannot fit
//! the next record. Segments are never deleted by the journal itself.

use crate::entry::{JournalRecord, JOURNAL_MAGIC};
use crate::error::JournalError;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier.
pub type SegmentId = u64;

const SEGMENT_EXTENSION: &str = ".skj";

/// Segment file name: 16 hex digits plus the `.skj` extension.
pub fn segment_filename(id: SegmentId) -> String {
    format!("{:016x}{}", id, SEGMENT_EXTENSION)
}

pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// Lists the segment ids present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, JournalError> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_segment_filename(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Result of decoding a segment file.
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// Valid records with their offsets.
    pub records: Vec<(u64, JournalRecord)>,
    /// Damaged regions skipped while resynchronizing on the magic bytes.
    pub invalid_records: u64,
    /// End offset of the last valid record. Anything after it is a torn tail.
    pub valid_len: u64,
}

/// One open segment file.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    sync_pending: bool,
}

impl Segment {
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, JournalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_size,
            sync_pending: false,
        })
    }

    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, JournalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            file,
            size,
            max_size,
            sync_pending: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// An empty segment accepts any record so oversized entries still land somewhere.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.size == 0 || self.size + record_size as u64 <= self.max_size
    }

    /// Appends a record, returning its offset within the segment.
    pub fn append(&mut self, record: &JournalRecord) -> Result<u64, JournalError> {
        let encoded = record.encode()?;
        let offset = self.size;

        self.file.seek(SeekFrom::End(0))?;
        if let Err(e) = self.file.write_all(&encoded) {
            // Drop a partial write so the next record starts on a boundary.
            let _ = self.file.set_len(offset);
            return Err(e.into());
        }
        self.size += encoded.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<(), JournalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    /// Decodes the segment.
    ///
    /// A record failing its checksum or header check is counted and skipped
    /// by searching for the next magic marker. Decoding stops at the first
    /// incomplete record or at zero padding.
    pub fn scan(&mut self) -> Result<SegmentScan, JournalError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut raw)?;

        let mut scan = SegmentScan::default();
        let mut offset = 0usize;
        while offset < raw.len() {
            let mut buf = BytesMut::from(&raw[offset..]);
            match JournalRecord::decode(&mut buf, offset as u64) {
                Ok(Some(record)) => {
                    let size = record.disk_size();
                    scan.records.push((offset as u64, record));
                    offset += size;
                    scan.valid_len = offset as u64;
                }
                Ok(None) => break,
                Err(JournalError::ChecksumMismatch { .. })
                | Err(JournalError::InvalidHeader { .. })
                | Err(JournalError::RecordTooLarge { .. }) => {
                    scan.invalid_records += 1;
                    match find_magic(&raw[offset + 1..]) {
                        Some(skip) => offset += 1 + skip,
                        None => break,
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scan)
    }

    /// Cuts the file back to `len` bytes, discarding a damaged tail.
    pub fn truncate_at(&mut self, len: u64) -> Result<(), JournalError> {
        self.file.set_len(len)?;
        self.size = len;
        self.file.seek(SeekFrom::End(0))?;
        self.sync_pending = true;
        self.sync()
    }
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(JOURNAL_MAGIC.len())
        .position(|window| window == JOURNAL_MAGIC)
}
