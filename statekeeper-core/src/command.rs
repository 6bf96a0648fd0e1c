//! Commands: side effects run on state entry and exit.

use crate::context::Context;
use crate::error::CoreError;
use crate::registry::ComponentSpec;
use serde_json::Value;
use std::fmt;

/// A named action executed against a transition context.
///
/// `Ok(false)` vetoes the transition; `Err` is a hard failure.
pub trait Command: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn execute(&self, ctx: &mut Context<'_>) -> Result<bool, CoreError>;
}

/// Assigns a literal value to a subject attribute.
#[derive(Debug, Clone)]
pub struct SetAttribute {
    attribute: String,
    value: Value,
}

impl SetAttribute {
    pub fn new(attribute: impl Into<String>, value: Value) -> Self {
        Self {
            attribute: attribute.into(),
            value,
        }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self, CoreError> {
        let attribute = spec.require_str("attribute")?;
        let value = spec.param("value").cloned().unwrap_or(Value::Null);
        Ok(Self::new(attribute, value))
    }
}

impl Command for SetAttribute {
    fn name(&self) -> &str {
        "SetAttribute"
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        ctx.subject_mut().set(&self.attribute, self.value.clone());
        ctx.subject_mut().save(&[self.attribute.as_str()])?;
        Ok(true)
    }
}

/// Severity used by [`LogMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(CoreError::invalid_schema(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// Emits a structured log line naming the subject and the event.
#[derive(Debug, Clone)]
pub struct LogMessage {
    message: String,
    level: LogLevel,
}

impl LogMessage {
    pub fn new(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            message: message.into(),
            level,
        }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self, CoreError> {
        let message = spec.require_str("message")?;
        let level = match spec.param_str("level") {
            Some(level) => LogLevel::parse(&level)?,
            None => LogLevel::Info,
        };
        Ok(Self::new(message, level))
    }
}

impl Command for LogMessage {
    fn name(&self) -> &str {
        "LogMessage"
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        let machine = ctx.machine().name();
        let model = ctx.subject().model_type().to_string();
        let model_pk = ctx.model_pk();
        let event = ctx.event().map(|e| e.label().to_string()).unwrap_or_default();

        match self.level {
            LogLevel::Debug => {
                tracing::debug!(machine = %machine, model = %model, model_pk = %model_pk, event = %event, "{}", self.message)
            }
            LogLevel::Info => {
                tracing::info!(machine = %machine, model = %model, model_pk = %model_pk, event = %event, "{}", self.message)
            }
            LogLevel::Warn => {
                tracing::warn!(machine = %machine, model = %model, model_pk = %model_pk, event = %event, "{}", self.message)
            }
            LogLevel::Error => {
                tracing::error!(machine = %machine, model = %model, model_pk = %model_pk, event = %event, "{}", self.message)
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_machine_with, Document};
    use serde_json::json;

    fn spec(params: Value) -> ComponentSpec {
        ComponentSpec {
            type_name: "statekeeper::commands::LogMessage".to_string(),
            tag: None,
            params: serde_json::from_value(params).unwrap(),
            machine: "article".to_string(),
        }
    }

    #[test]
    fn test_set_attribute_executes() {
        let machine = sample_machine_with(|b| b);
        let mut doc = Document::new(1);
        let mut ctx = Context::new(&machine, &mut doc, None, "status", "status");
        let ok = SetAttribute::new("reviewed", json!(true))
            .execute(&mut ctx)
            .unwrap();
        assert!(ok);
        drop(ctx);
        assert_eq!(doc.attr("reviewed"), json!(true));
        assert_eq!(doc.saves(), vec!["reviewed".to_string()]);
    }

    #[test]
    fn test_set_attribute_requires_name() {
        let mut s = spec(json!({"value": 1}));
        s.type_name = "statekeeper::commands::SetAttribute".to_string();
        assert!(SetAttribute::from_spec(&s).is_err());
    }

    #[test]
    fn test_log_message_levels() {
        let cmd = LogMessage::from_spec(&spec(json!({"message": "hi", "level": "WARN"}))).unwrap();
        assert_eq!(cmd.level, LogLevel::Warn);
        assert!(LogMessage::from_spec(&spec(json!({"message": "hi", "level": "loud"}))).is_err());

        let machine = sample_machine_with(|b| b);
        let mut doc = Document::new(1);
        let mut ctx = Context::new(&machine, &mut doc, None, "status", "status");
        assert!(cmd.execute(&mut ctx).unwrap());
    }
}
