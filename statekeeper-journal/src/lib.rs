//! # statekeeper-journal
//!
//! Durable audit journal for statekeeper.
//!
//! This crate provides:
//! - The [`AuditEntry`] record written for every state change
//! - Per-record CRC32C checksums and sequence numbers
//! - Segment files with size-based rotation
//! - Configurable fsync policies
//! - Recovery from partially written tail records

pub mod entry;
pub mod error;
pub mod journal;
pub mod recovery;
pub mod segment;

pub use entry::{AuditEntry, EntryType, JournalRecord};
pub use error::JournalError;
pub use journal::{FsyncPolicy, Journal, JournalConfig, JournalStats};
pub use segment::{Segment, SegmentId};

/// Default segment size (8 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;

/// Journal record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;
