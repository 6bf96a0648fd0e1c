//! Component registry.
//!
//! Commands and conditions are named in schema documents and instantiated
//! through factories registered here under fully qualified names such as
//! `statekeeper::commands::SetAttribute`.

use crate::command::{Command, LogMessage, SetAttribute};
use crate::condition::{AttributeCheck, Condition, Permission};
use crate::error::CoreError;
use crate::schema::ComponentNode;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const NAMESPACE_SEPARATOR: &str = "::";
pub const DEFAULT_COMMANDS_NAMESPACE: &str = "statekeeper::commands";
pub const DEFAULT_CONDITIONS_NAMESPACE: &str = "statekeeper::conditions";

/// Construction input handed to a factory.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Fully qualified type name.
    pub type_name: String,
    pub tag: Option<String>,
    pub params: BTreeMap<String, Value>,
    /// Name of the owning machine.
    pub machine: String,
}

impl ComponentSpec {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// A parameter rendered as a string. Numbers and booleans are stringified.
    pub fn param_str(&self, name: &str) -> Option<String> {
        match self.params.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn require_str(&self, name: &str) -> Result<String, CoreError> {
        self.param_str(name).ok_or_else(|| {
            CoreError::invalid_schema(format!(
                "{} requires parameter '{}'",
                self.short_name(),
                name
            ))
        })
    }

    /// Type name without its namespace.
    pub fn short_name(&self) -> &str {
        short_name(&self.type_name)
    }
}

pub(crate) fn short_name(type_name: &str) -> &str {
    type_name
        .rsplit(NAMESPACE_SEPARATOR)
        .next()
        .unwrap_or(type_name)
}

pub type CommandFactory =
    Arc<dyn Fn(&ComponentSpec) -> Result<Arc<dyn Command>, CoreError> + Send + Sync>;
pub type ConditionFactory =
    Arc<dyn Fn(&ComponentSpec) -> Result<Arc<dyn Condition>, CoreError> + Send + Sync>;

#[derive(Clone)]
enum Factory {
    Command(CommandFactory),
    Condition(ConditionFactory),
}

impl Factory {
    fn kind(&self) -> &'static str {
        match self {
            Factory::Command(_) => "command",
            Factory::Condition(_) => "condition",
        }
    }
}

/// Name-keyed factories for commands and conditions.
#[derive(Default)]
pub struct Registry {
    factories: DashMap<String, Factory>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in commands and conditions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_command(
            format!("{}::SetAttribute", DEFAULT_COMMANDS_NAMESPACE),
            |spec| Ok(Arc::new(SetAttribute::from_spec(spec)?) as Arc<dyn Command>),
        );
        registry.register_command(
            format!("{}::LogMessage", DEFAULT_COMMANDS_NAMESPACE),
            |spec| Ok(Arc::new(LogMessage::from_spec(spec)?) as Arc<dyn Command>),
        );
        registry.register_condition(
            format!("{}::AttributeCheck", DEFAULT_CONDITIONS_NAMESPACE),
            |spec| Ok(Arc::new(AttributeCheck::from_spec(spec)?) as Arc<dyn Condition>),
        );
        registry.register_condition(
            format!("{}::Permission", DEFAULT_CONDITIONS_NAMESPACE),
            |spec| Ok(Arc::new(Permission::from_spec(spec)?) as Arc<dyn Condition>),
        );
        registry
    }

    /// Registers a command factory, replacing any previous entry of that name.
    pub fn register_command<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentSpec) -> Result<Arc<dyn Command>, CoreError> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.into(), Factory::Command(Arc::new(factory)));
    }

    /// Registers a condition factory, replacing any previous entry of that name.
    pub fn register_condition<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentSpec) -> Result<Arc<dyn Condition>, CoreError> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.into(), Factory::Condition(Arc::new(factory)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn factory(&self, name: &str) -> Option<Factory> {
        self.factories.get(name).map(|entry| entry.value().clone())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}

/// Turns schema nodes into component instances for one machine.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<Registry>,
    machine: String,
    commands_namespace: String,
    conditions_namespace: String,
    infer_type_from_tag: bool,
}

impl Resolver {
    pub fn new(registry: Arc<Registry>, machine: impl Into<String>) -> Self {
        Self {
            registry,
            machine: machine.into(),
            commands_namespace: DEFAULT_COMMANDS_NAMESPACE.to_string(),
            conditions_namespace: DEFAULT_CONDITIONS_NAMESPACE.to_string(),
            infer_type_from_tag: false,
        }
    }

    pub fn with_namespaces(
        mut self,
        commands: impl Into<String>,
        conditions: impl Into<String>,
    ) -> Self {
        self.commands_namespace = commands.into();
        self.conditions_namespace = conditions.into();
        self
    }

    pub fn with_infer_type_from_tag(mut self, infer: bool) -> Self {
        self.infer_type_from_tag = infer;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn command(&self, node: &ComponentNode) -> Result<Arc<dyn Command>, CoreError> {
        let spec = self.spec(node, &self.commands_namespace)?;
        match self.lookup(&spec, "command")? {
            Factory::Command(factory) => factory(&spec),
            other => Err(self.wrong_kind(&spec, "command", other.kind())),
        }
    }

    pub fn condition(&self, node: &ComponentNode) -> Result<Arc<dyn Condition>, CoreError> {
        let spec = self.spec(node, &self.conditions_namespace)?;
        match self.lookup(&spec, "condition")? {
            Factory::Condition(factory) => factory(&spec),
            other => Err(self.wrong_kind(&spec, "condition", other.kind())),
        }
    }

    fn spec(&self, node: &ComponentNode, namespace: &str) -> Result<ComponentSpec, CoreError> {
        let type_name = self.type_name(node)?;
        let type_name = if type_name.contains(NAMESPACE_SEPARATOR) {
            type_name
        } else {
            format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, type_name)
        };

        Ok(ComponentSpec {
            type_name,
            tag: node.tag.clone(),
            params: node.params.clone(),
            machine: self.machine.clone(),
        })
    }

    fn type_name(&self, node: &ComponentNode) -> Result<String, CoreError> {
        if let Some(name) = node.type_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }

        match node.tag.as_deref() {
            Some(tag) if self.infer_type_from_tag && !tag.is_empty() => {
                let mut chars = tag.chars();
                Ok(match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                })
            }
            _ => Err(CoreError::invalid_schema(format!(
                "component '{}' in machine '{}' has no type",
                node.tag.as_deref().unwrap_or("<anonymous>"),
                self.machine
            ))),
        }
    }

    fn lookup(&self, spec: &ComponentSpec, kind: &str) -> Result<Factory, CoreError> {
        self.registry.factory(&spec.type_name).ok_or_else(|| {
            CoreError::invalid_schema(format!(
                "unknown {} type '{}' in machine '{}'",
                kind, spec.type_name, self.machine
            ))
        })
    }

    fn wrong_kind(&self, spec: &ComponentSpec, expected: &str, actual: &str) -> CoreError {
        CoreError::invalid_schema(format!(
            "'{}' is a {}, expected a {} in machine '{}'",
            spec.type_name, actual, expected, self.machine
        ))
    }
}
