//! The journal handle.

use crate::entry::{AuditEntry, JournalRecord};
use crate::error::JournalError;
use crate::recovery::RecoveryScanner;
use crate::segment::{list_segments, Segment, SegmentId};
use crate::DEFAULT_SEGMENT_SIZE;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// When appended records are flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every append.
    #[default]
    EveryWrite,
    /// Fsync after every N appends.
    EveryN(u32),
    /// Leave flushing to the OS; callers may still call [`Journal::sync`].
    Never,
}

impl FsyncPolicy {
    /// Parses the compact form used in environment variables:
    /// `every_write`, `never` or `every_n:<count>`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        match value.as_str() {
            "every_write" | "everywrite" => Some(FsyncPolicy::EveryWrite),
            "never" => Some(FsyncPolicy::Never),
            other => other
                .strip_prefix("every_n:")
                .and_then(|n| n.parse().ok())
                .map(FsyncPolicy::EveryN),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    pub segment_size: u64,
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// I/O counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
}

/// Append-only audit journal stored as a series of segment files.
pub struct Journal {
    config: JournalConfig,
    /// Segment receiving appends.
    current: Mutex<Segment>,
    next_sequence: AtomicU64,
    writes_since_sync: AtomicU64,
    closed: AtomicBool,
    entries_written: AtomicU64,
    bytes_written: AtomicU64,
    fsyncs: AtomicU64,
}

impl Journal {
    /// Opens the journal, repairing a torn tail left by an interrupted write.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        std::fs::create_dir_all(&config.dir)?;

        let report = RecoveryScanner::new(&config.dir, config.segment_size).scan(true)?;
        if !report.is_clean() {
            tracing::warn!(
                invalid = report.invalid_records,
                truncated = report.bytes_truncated,
                "journal recovered with damage"
            );
        }

        let current = match list_segments(&config.dir)?.last() {
            Some(&id) => Segment::open(&config.dir, id, config.segment_size)?,
            None => Segment::create(&config.dir, 1, config.segment_size)?,
        };

        tracing::info!(
            dir = %config.dir.display(),
            records = report.valid_records,
            next_sequence = report.max_sequence + 1,
            "journal opened"
        );

        Ok(Self {
            config,
            current: Mutex::new(current),
            next_sequence: AtomicU64::new(report.max_sequence + 1),
            writes_since_sync: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            entries_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            fsyncs: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Appends an entry and returns its sequence number.
    pub fn append(&self, entry: &AuditEntry) -> Result<u64, JournalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::Closed);
        }

        let mut current = self.current.lock();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = JournalRecord::from_entry(entry, sequence)?;

        if !current.can_fit(record.disk_size()) {
            current.sync()?;
            let next = Segment::create(&self.config.dir, current.id() + 1, self.config.segment_size)?;
            tracing::debug!(segment = next.id(), "journal rotated");
            *current = next;
        }

        current.append(&record)?;
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(record.disk_size() as u64, Ordering::Relaxed);

        let writes = self.writes_since_sync.fetch_add(1, Ordering::Relaxed) + 1;
        let due = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => writes >= u64::from(n.max(1)),
            FsyncPolicy::Never => false,
        };
        if due {
            current.sync()?;
            self.fsyncs.fetch_add(1, Ordering::Relaxed);
            self.writes_since_sync.store(0, Ordering::Relaxed);
        }

        Ok(sequence)
    }

    /// Reads every intact entry in sequence order.
    pub fn read_all(&self) -> Result<Vec<(u64, AuditEntry)>, JournalError> {
        self.read_from(0, None)
    }

    /// Reads entries with a sequence number of at least `from`.
    pub fn read_from(
        &self,
        from: u64,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, AuditEntry)>, JournalError> {
        // Hold the writer lock so a concurrent append cannot be read half-written.
        let _writer = self.current.lock();
        let limit = limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();

        for id in list_segments(&self.config.dir)? {
            let mut segment = Segment::open(&self.config.dir, id, self.config.segment_size)?;
            for (_, record) in segment.scan()?.records {
                if record.header.sequence < from {
                    continue;
                }
                entries.push((record.header.sequence, record.entry()?));
                if entries.len() >= limit {
                    return Ok(entries);
                }
            }
        }

        Ok(entries)
    }

    pub fn sync(&self) -> Result<(), JournalError> {
        self.current.lock().sync()?;
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
        self.writes_since_sync.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes and rejects further appends.
    pub fn close(&self) -> Result<(), JournalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn segment_ids(&self) -> Result<Vec<SegmentId>, JournalError> {
        list_segments(&self.config.dir)
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
        }
    }
}
