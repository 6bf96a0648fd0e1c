//! Core error types.

use thiserror::Error;

/// Errors from the schema model and the transition engine.
///
/// `Clone` so the same failure can be recorded on a transition context and
/// returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid schema: {reason}")]
    InvalidSchema { reason: String },

    #[error("cannot load schema: {reason}")]
    SchemaSource { reason: String },

    #[error("state machine not found: {machine}")]
    StateMachineNotFound { machine: String },

    #[error("state '{state}' not found in machine '{machine}'")]
    StateNotFound { machine: String, state: String },

    #[error("cannot guess event from '{from}' to '{target}': {reason}")]
    CannotGuessEvent {
        from: String,
        target: String,
        reason: String,
    },

    #[error("event '{event}' for role '{role}' not found in state machine '{machine}'")]
    EventNotFound {
        machine: String,
        event: String,
        role: String,
    },

    #[error("transition failed: {reason}")]
    Transition { reason: String },

    #[error("invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("store error: {reason}")]
    Store { reason: String },

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Json(e.to_string())
    }
}

impl From<statekeeper_journal::JournalError> for CoreError {
    fn from(e: statekeeper_journal::JournalError) -> Self {
        CoreError::Store {
            reason: e.to_string(),
        }
    }
}

impl CoreError {
    pub(crate) fn invalid_schema(reason: impl Into<String>) -> Self {
        CoreError::InvalidSchema {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl ToString) -> Self {
        CoreError::Store {
            reason: reason.to_string(),
        }
    }

    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Store { .. })
    }

    /// Returns a stable code for logs and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidSchema { .. } => "INVALID_SCHEMA",
            CoreError::SchemaSource { .. } => "SCHEMA_SOURCE",
            CoreError::StateMachineNotFound { .. } => "STATE_MACHINE_NOT_FOUND",
            CoreError::StateNotFound { .. } => "STATE_NOT_FOUND",
            CoreError::CannotGuessEvent { .. } => "CANNOT_GUESS_EVENT",
            CoreError::EventNotFound { .. } => "EVENT_NOT_FOUND",
            CoreError::Transition { .. } => "TRANSITION_FAILED",
            CoreError::InvalidValue { .. } => "INVALID_VALUE",
            CoreError::Command { .. } => "COMMAND_FAILED",
            CoreError::Store { .. } => "STORE_ERROR",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}
