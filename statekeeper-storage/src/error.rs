//! Storage error types.

use statekeeper_core::CoreError;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("journal error: {0}")]
    Journal(#[from] statekeeper_journal::JournalError),

    #[error("record not found: {model} {pk}")]
    RecordNotFound { model: String, pk: String },

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Returns a stable code for logs and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "IO_ERROR",
            StorageError::Json(_) => "JSON_ERROR",
            StorageError::Journal(_) => "JOURNAL_ERROR",
            StorageError::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            StorageError::Corruption(_) => "CORRUPTION",
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(e: StorageError) -> Self {
        CoreError::store(e)
    }
}
