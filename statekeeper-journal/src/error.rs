//! Journal error types.

use thiserror::Error;

/// Errors raised while writing or reading the journal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal record at offset {offset} failed its checksum (expected {expected:#x}, got {actual:#x})")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid journal header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("journal record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("journal is closed")]
    Closed,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JournalError {
    /// Returns whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JournalError::Io(_))
    }
}
