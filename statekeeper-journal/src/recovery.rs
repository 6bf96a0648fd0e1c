//! Journal recovery.
//!
//! A crash can leave a torn record at the end of the newest segment.
//! Recovery truncates each segment back to the end of its last valid record
//! and reports damaged regions that were skipped.

use crate::error::JournalError;
use crate::segment::{list_segments, Segment, SegmentId};
use std::path::{Path, PathBuf};

/// Outcome of a recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub valid_records: u64,
    pub invalid_records: u64,
    pub bytes_truncated: u64,
    /// Segments that had a torn tail or damaged records.
    pub segments_repaired: Vec<SegmentId>,
    pub max_sequence: u64,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_records == 0 && self.bytes_truncated == 0
    }
}

/// Scans a journal directory, optionally repairing it.
pub struct RecoveryScanner {
    dir: PathBuf,
    segment_size: u64,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>, segment_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            segment_size,
        }
    }

    pub fn scan(&self, repair: bool) -> Result<RecoveryReport, JournalError> {
        let mut report = RecoveryReport::default();

        for id in list_segments(&self.dir)? {
            let mut segment = Segment::open(&self.dir, id, self.segment_size)?;
            let scan = segment.scan()?;
            let torn = segment.size() - scan.valid_len;

            report.valid_records += scan.records.len() as u64;
            report.invalid_records += scan.invalid_records;
            report.bytes_truncated += torn;
            if let Some(max) = scan.records.iter().map(|(_, r)| r.header.sequence).max() {
                report.max_sequence = report.max_sequence.max(max);
            }
            if torn > 0 || scan.invalid_records > 0 {
                report.segments_repaired.push(id);
            }

            if repair && torn > 0 {
                segment.truncate_at(scan.valid_len)?;
                tracing::warn!(
                    segment = id,
                    offset = scan.valid_len,
                    bytes = torn,
                    "truncated torn journal tail"
                );
            }
        }

        Ok(report)
    }
}

/// Reports journal damage without modifying any file.
pub fn verify_journal(
    dir: impl AsRef<Path>,
    segment_size: u64,
) -> Result<RecoveryReport, JournalError> {
    RecoveryScanner::new(dir, segment_size).scan(false)
}

/// Truncates torn tails in every segment.
pub fn repair_journal(
    dir: impl AsRef<Path>,
    segment_size: u64,
) -> Result<RecoveryReport, JournalError> {
    RecoveryScanner::new(dir, segment_size).scan(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests::sample_entry;
    use crate::entry::JournalRecord;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_segment(dir: &Path, count: u64) -> PathBuf {
        let mut segment = Segment::create(dir, 1, 64 * 1024).unwrap();
        for seq in 1..=count {
            let record = JournalRecord::from_entry(&sample_entry(Some("a"), "b"), seq).unwrap();
            segment.append(&record).unwrap();
        }
        segment.sync().unwrap();
        segment.path().to_path_buf()
    }

    #[test]
    fn test_clean_journal() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 3);

        let report = verify_journal(dir.path(), 64 * 1024).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.valid_records, 3);
        assert_eq!(report.max_sequence, 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 2);
        let clean_len = std::fs::metadata(&path).unwrap().len();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"SKJL\x02\x00\x00\x00\x00\x00").unwrap();
        drop(file);

        let report = verify_journal(dir.path(), 64 * 1024).unwrap();
        assert_eq!(report.valid_records, 2);
        assert_eq!(report.bytes_truncated, 10);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len + 10);

        repair_journal(dir.path(), 64 * 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
        assert!(verify_journal(dir.path(), 64 * 1024).unwrap().is_clean());
    }

    #[test]
    fn test_damaged_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 3);

        // Flip a payload byte of the first record.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[crate::RECORD_HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let report = verify_journal(dir.path(), 64 * 1024).unwrap();
        assert_eq!(report.invalid_records, 1);
        assert_eq!(report.valid_records, 2);
        assert_eq!(report.bytes_truncated, 0);
        assert_eq!(report.segments_repaired, vec![1]);
    }
}
