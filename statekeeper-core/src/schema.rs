//! Declarative schema documents.
//!
//! A document holds any number of named machines and is written in JSON or
//! YAML:
//!
//! ```yaml
//! state_machines:
//!   - name: article
//!     initial_state: draft
//!     states:
//!       - value: draft
//!         label: Draft
//!         color: grey            # extra data attribute
//!         events:
//!           - label: submit
//!             target: review
//!             roles: [editor]
//!             conditions:
//!               - type: AttributeCheck
//!                 getter: status
//!                 expectedValue: active
//!         timeouts:
//!           - label: expire
//!             target: archived
//!             hours: 1
//!         enter:
//!           - type: SetAttribute
//!             attribute: reviewed
//!             value: false
//! ```
//!
//! Documents are plain data. Validation happens when a machine resolves its
//! states.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A parsed schema document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default, rename = "state_machines", alias = "machines")]
    pub machines: Vec<MachineSchema>,
}

impl SchemaDocument {
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|e| CoreError::SchemaSource {
            reason: format!("invalid JSON schema: {}", e),
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(text).map_err(|e| CoreError::SchemaSource {
            reason: format!("invalid YAML schema: {}", e),
        })
    }

    /// Reads a document from disk; `.json` files are parsed as JSON, anything
    /// else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CoreError::SchemaSource {
                reason: format!("schema file '{}' does not exist", path.display()),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::SchemaSource {
            reason: format!("cannot read '{}': {}", path.display(), e),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    /// Looks up a machine by name.
    pub fn machine(&self, name: &str) -> Result<&MachineSchema, CoreError> {
        self.machines
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| CoreError::StateMachineNotFound {
                machine: name.to_string(),
            })
    }

    pub fn machine_names(&self) -> Vec<&str> {
        self.machines.iter().map(|m| m.name.as_str()).collect()
    }
}

/// One machine as declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSchema {
    pub name: String,
    #[serde(default, deserialize_with = "optional_scalar_string")]
    pub initial_state: Option<String>,
    #[serde(default)]
    pub states: Vec<StateSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSchema {
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub events: Vec<EventSchema>,
    #[serde(default)]
    pub timeouts: Vec<TimeoutSchema>,
    #[serde(default)]
    pub enter: Vec<ComponentNode>,
    #[serde(default)]
    pub exit: Vec<ComponentNode>,
    /// Every other attribute of the state.
    #[serde(flatten)]
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSchema {
    #[serde(default)]
    pub label: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub target: String,
    /// A single role or a list of roles.
    #[serde(default, deserialize_with = "string_or_list")]
    pub roles: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ComponentNode>,
    #[serde(flatten)]
    pub data: BTreeMap<String, Value>,
}

/// An event fired automatically once its offset has elapsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSchema {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(flatten)]
    pub event: EventSchema,
}

impl TimeoutSchema {
    /// Total offset in seconds, `None` on overflow.
    pub fn offset_seconds(&self) -> Option<i64> {
        self.days
            .checked_mul(86_400)?
            .checked_add(self.hours.checked_mul(3_600)?)?
            .checked_add(self.minutes.checked_mul(60)?)
    }
}

/// A command or condition declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentNode {
    /// Element name; used for display and for legacy type inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Type identifier, optionally namespace qualified.
    #[serde(
        default,
        rename = "type",
        alias = "class",
        skip_serializing_if = "Option::is_none"
    )]
    pub type_name: Option<String>,
    /// Construction parameters.
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl ComponentNode {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            tag: None,
            type_name: Some(type_name.into()),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// Loads a machine document on demand.
pub type SchemaLoader = Arc<dyn Fn(&str) -> Result<SchemaDocument, CoreError> + Send + Sync>;

/// Where a machine reads its schema from. Loaded on first use.
#[derive(Clone)]
pub enum SchemaSource {
    Document(Arc<SchemaDocument>),
    Json(String),
    Yaml(String),
    File(PathBuf),
    /// Called with the machine name.
    Loader(SchemaLoader),
}

impl SchemaSource {
    pub fn loader<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<SchemaDocument, CoreError> + Send + Sync + 'static,
    {
        SchemaSource::Loader(Arc::new(f))
    }

    /// Loads the source and extracts the named machine.
    pub fn load(&self, machine: &str) -> Result<MachineSchema, CoreError> {
        let document = match self {
            SchemaSource::Document(document) => return document.machine(machine).cloned(),
            SchemaSource::Json(text) => SchemaDocument::from_json(text)?,
            SchemaSource::Yaml(text) => SchemaDocument::from_yaml(text)?,
            SchemaSource::File(path) => SchemaDocument::from_file(path)?,
            SchemaSource::Loader(load) => load(machine)?,
        };
        document.machine(machine).cloned()
    }
}

impl From<SchemaDocument> for SchemaSource {
    fn from(document: SchemaDocument) -> Self {
        SchemaSource::Document(Arc::new(document))
    }
}

impl fmt::Debug for SchemaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaSource::Document(d) => write!(f, "Document({:?})", d.machine_names()),
            SchemaSource::Json(_) => f.write_str("Json(..)"),
            SchemaSource::Yaml(_) => f.write_str("Yaml(..)"),
            SchemaSource::File(path) => write!(f, "File({})", path.display()),
            SchemaSource::Loader(_) => f.write_str("Loader(..)"),
        }
    }
}

// =========================================================================
// Lenient scalar handling
// =========================================================================

struct ScalarVisitor;

impl<'de> serde::de::Visitor<'de> for ScalarVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string, number or boolean")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> Result<String, E> {
        Ok(v)
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<String, E> {
        Ok(v.to_string())
    }
}

/// State values may be written as numbers or booleans in YAML; they are
/// always compared as strings.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_any(ScalarVisitor)
}

fn optional_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a scalar initial state, got {}",
            other
        ))),
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, SeqAccess, Visitor};

    struct RolesVisitor;

    impl<'de> Visitor<'de> for RolesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut roles = Vec::new();
            while let Some(role) = seq.next_element::<String>()? {
                roles.push(role);
            }
            Ok(roles)
        }
    }

    deserializer.deserialize_any(RolesVisitor)
}
