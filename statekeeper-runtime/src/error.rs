//! Runtime error types.

use crate::config::ConfigError;
use statekeeper_core::CoreError;
use statekeeper_storage::StorageError;
use thiserror::Error;

/// Errors raised while assembling or driving the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no binding for {model}.{attribute}")]
    UnknownBinding { model: String, attribute: String },

    #[error("model '{model}' has several bindings; name the attribute")]
    AmbiguousBinding { model: String },
}

impl RuntimeError {
    /// Returns a stable code for logs and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Storage(e) => e.error_code(),
            RuntimeError::UnknownBinding { .. } => "UNKNOWN_BINDING",
            RuntimeError::AmbiguousBinding { .. } => "AMBIGUOUS_BINDING",
        }
    }
}
