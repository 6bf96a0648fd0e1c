//! Subjects: the externally owned entities a machine governs.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The acting identity behind a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistence-side view of a subject.
///
/// Implemented by whatever owns the entity. The engine only reads and
/// writes attributes through this trait and never assigns ids itself.
pub trait Subject: Send {
    /// Subject type, e.g. `article`.
    fn model_type(&self) -> &str;

    /// Primary key; serialized with sorted keys for journal and timeout records.
    fn primary_key(&self) -> Value;

    fn get(&self, attribute: &str) -> Option<Value>;

    fn set(&mut self, attribute: &str, value: Value);

    /// Persists the named attributes.
    fn save(&mut self, _attributes: &[&str]) -> Result<(), CoreError> {
        Ok(())
    }

    /// Set by an external delete hook.
    fn is_deleted(&self) -> bool {
        false
    }

    /// Records a validation error against an attribute.
    fn add_error(&mut self, attribute: &str, message: String);

    /// Role the identity holds on this subject.
    fn role_for(&self, _identity: &Identity) -> Option<String> {
        None
    }
}

/// Loads subjects by type and primary key.
pub trait SubjectStore: Send + Sync {
    fn load(
        &self,
        model_type: &str,
        primary_key: &Value,
    ) -> Result<Option<Box<dyn Subject>>, CoreError>;
}

/// Renders a scalar attribute value as a state value.
///
/// `null` and the empty string both mean "no value".
pub fn value_as_state(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
