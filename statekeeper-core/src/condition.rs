//! Conditions: predicates that gate events.

use crate::context::Context;
use crate::error::CoreError;
use crate::registry::ComponentSpec;
use crate::subject::Identity;
use serde_json::Value;
use std::fmt;

/// A named predicate evaluated against a transition context.
///
/// Conditions never mutate the context.
pub trait Condition: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn check(&self, ctx: &Context<'_>) -> bool;
}

/// Authorization collaborator consulted by [`Permission`].
pub trait Authorizer: Send + Sync {
    fn can(&self, identity: &Identity, permission: &str, ctx: &Context<'_>) -> bool;
}

/// Compares a subject attribute to an expected value.
///
/// Parameters: `getter` (attribute name), `expectedValue`, `strictMode`.
/// Strict mode compares JSON values exactly. Loose mode coerces numbers,
/// booleans and trimmed strings before comparing.
#[derive(Debug, Clone)]
pub struct AttributeCheck {
    getter: String,
    expected: Value,
    strict: bool,
}

impl AttributeCheck {
    pub fn new(getter: impl Into<String>, expected: Value, strict: bool) -> Self {
        Self {
            getter: getter.into(),
            expected,
            strict,
        }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self, CoreError> {
        let getter = spec.require_str("getter")?;
        let expected = spec
            .param("expectedValue")
            .or_else(|| spec.param("expected_value"))
            .cloned()
            .unwrap_or(Value::Null);
        let strict = match spec.param("strictMode").or_else(|| spec.param("strict_mode")) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        };
        Ok(Self::new(getter, expected, strict))
    }
}

impl Condition for AttributeCheck {
    fn name(&self) -> &str {
        "AttributeCheck"
    }

    fn check(&self, ctx: &Context<'_>) -> bool {
        let actual = ctx.subject().get(&self.getter).unwrap_or(Value::Null);
        if self.strict {
            actual == self.expected
        } else {
            loose_eq(&actual, &self.expected)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Bool(_), _) | (_, Value::Bool(_)) => truthy(actual) == truthy(expected),
        (Value::Null, other) | (other, Value::Null) => !truthy(other),
        (Value::String(a), Value::String(b)) => {
            if let (Some(x), Some(y)) = (as_number(actual), as_number(expected)) {
                x == y
            } else {
                a.trim() == b.trim()
            }
        }
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(actual), as_number(expected)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Number(_), Value::Number(_)) => as_number(actual) == as_number(expected),
        _ => actual == expected,
    }
}

/// Delegates to the machine's [`Authorizer`].
///
/// Parameter: `permission` (string, or a list whose first entry is used).
/// An empty permission always passes. Without an identity or an authorizer
/// the check is denied.
#[derive(Debug, Clone)]
pub struct Permission {
    permission: String,
}

impl Permission {
    pub fn new(permission: impl Into<String>) -> Self {
        Self {
            permission: permission.into(),
        }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self, CoreError> {
        let permission = match spec.param("permission") {
            Some(Value::Array(items)) => items
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => spec.param_str("permission").unwrap_or_default(),
        };
        Ok(Self::new(permission))
    }
}

impl Condition for Permission {
    fn name(&self) -> &str {
        "Permission"
    }

    fn check(&self, ctx: &Context<'_>) -> bool {
        if self.permission.is_empty() {
            return true;
        }
        match (ctx.identity(), ctx.machine().authorizer()) {
            (Some(identity), Some(authorizer)) => authorizer.can(identity, &self.permission, ctx),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_machine_with, Document};
    use crate::machine::StateMachine;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_loose_equality() {
        assert!(loose_eq(&json!("active "), &json!("active")));
        assert!(loose_eq(&json!(1), &json!("1")));
        assert!(loose_eq(&json!("1.0"), &json!(1)));
        assert!(loose_eq(&json!(null), &json!("")));
        assert!(loose_eq(&json!(null), &json!(false)));
        assert!(loose_eq(&json!("yes"), &json!(true)));
        assert!(!loose_eq(&json!("0"), &json!(true)));
        assert!(!loose_eq(&json!("active"), &json!("inactive")));
        assert!(!loose_eq(&json!("abc"), &json!(0)));
    }

    #[test]
    fn test_attribute_check_strict_and_loose() {
        let machine = sample_machine_with(|b| b);
        let mut doc = Document::new(1).with("status", json!("active "));
        let ctx = Context::new(&machine, &mut doc, None, "status", "status");

        assert!(AttributeCheck::new("status", json!("active"), false).check(&ctx));
        assert!(!AttributeCheck::new("status", json!("active"), true).check(&ctx));
        assert!(AttributeCheck::new("status", json!("active "), true).check(&ctx));
    }

    #[test]
    fn test_strict_mode_parsing() {
        let spec = ComponentSpec {
            type_name: "statekeeper::conditions::AttributeCheck".to_string(),
            tag: None,
            params: [
                ("getter".to_string(), json!("status")),
                ("strictMode".to_string(), json!("true")),
            ]
            .into_iter()
            .collect(),
            machine: "article".to_string(),
        };
        let check = AttributeCheck::from_spec(&spec).unwrap();
        assert!(check.strict);
        assert_eq!(check.expected, Value::Null);
    }

    struct Editors;

    impl Authorizer for Editors {
        fn can(&self, identity: &Identity, permission: &str, _ctx: &Context<'_>) -> bool {
            identity.as_str() == "alice" && permission == "publish"
        }
    }

    #[test]
    fn test_permission_delegates() {
        let machine: StateMachine = sample_machine_with(|b| b.with_authorizer(Arc::new(Editors)));
        let mut doc = Document::new(1);
        let alice = Identity::from("alice");
        let bob = Identity::from("bob");

        let ctx = Context::new(&machine, &mut doc, Some(&alice), "status", "status");
        assert!(Permission::new("publish").check(&ctx));
        assert!(!Permission::new("delete").check(&ctx));
        assert!(Permission::new("").check(&ctx));
        drop(ctx);

        let ctx = Context::new(&machine, &mut doc, Some(&bob), "status", "status");
        assert!(!Permission::new("publish").check(&ctx));
        drop(ctx);

        let ctx = Context::new(&machine, &mut doc, None, "status", "status");
        assert!(!Permission::new("publish").check(&ctx));
    }

    #[test]
    fn test_permission_without_authorizer_denies() {
        let machine = sample_machine_with(|b| b);
        let mut doc = Document::new(1);
        let alice = Identity::from("alice");
        let ctx = Context::new(&machine, &mut doc, Some(&alice), "status", "status");
        assert!(!Permission::new("publish").check(&ctx));
    }
}
