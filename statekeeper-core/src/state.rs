//! States and event lookup.

use crate::command::Command;
use crate::context::Context;
use crate::error::CoreError;
use crate::event::Event;
use crate::registry::{short_name, Resolver};
use crate::schema::{ComponentNode, StateSchema};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type Commands = Arc<[Arc<dyn Command>]>;

/// How an event lookup decides whether a candidate is usable.
#[derive(Clone, Copy)]
pub enum Eligibility<'c, 'a> {
    /// Role check only.
    Role(Option<&'c str>),
    /// Role check against the context's role plus every condition.
    Context(&'c Context<'a>),
}

/// A resolved state. Immutable once built; command lists are instantiated on
/// first use.
#[derive(Debug)]
pub struct State {
    machine: String,
    value: String,
    label: String,
    initial: bool,
    data: BTreeMap<String, Value>,
    events: Vec<Arc<Event>>,
    timeouts: Vec<Arc<Event>>,
    enter: Vec<ComponentNode>,
    exit: Vec<ComponentNode>,
    resolver: Arc<Resolver>,
    enter_commands: RwLock<Option<Commands>>,
    exit_commands: RwLock<Option<Commands>>,
}

impl State {
    pub(crate) fn build(
        machine: &str,
        schema: &StateSchema,
        initial: bool,
        resolver: Arc<Resolver>,
    ) -> Result<Self, CoreError> {
        let events = schema
            .events
            .iter()
            .map(|e| Event::from_schema(&schema.value, e, &resolver).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let timeouts = schema
            .timeouts
            .iter()
            .map(|t| Event::timeout_from_schema(&schema.value, t, &resolver).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            machine: machine.to_string(),
            value: schema.value.clone(),
            label: schema.label.clone(),
            initial,
            data: schema.data.clone(),
            events,
            timeouts,
            enter: schema.enter.clone(),
            exit: schema.exit.clone(),
            resolver,
            enter_commands: RwLock::new(None),
            exit_commands: RwLock::new(None),
        })
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The label, or the value when no label is declared.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.value
        } else {
            &self.label
        }
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    /// A state without outgoing events.
    pub fn is_final(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_intermediate(&self) -> bool {
        !self.is_initial() && !self.is_final()
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn data_value(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Outgoing events, optionally filtered by role.
    pub fn events(&self, role: Option<&str>) -> Vec<Arc<Event>> {
        match role {
            None => self.events.clone(),
            Some(_) => self
                .events
                .iter()
                .filter(|e| e.is_role_valid(role))
                .cloned()
                .collect(),
        }
    }

    /// Events valid for the context, conditions included.
    pub fn eligible_events(&self, ctx: &Context<'_>) -> Vec<Arc<Event>> {
        self.events
            .iter()
            .filter(|e| e.is_valid(ctx))
            .cloned()
            .collect()
    }

    pub fn timeouts(&self) -> &[Arc<Event>] {
        &self.timeouts
    }

    pub fn events_targeting(&self, target: &str) -> Vec<Arc<Event>> {
        self.events
            .iter()
            .filter(|e| e.target() == target)
            .cloned()
            .collect()
    }

    /// First event, then timeout, with the label that passes the eligibility
    /// check.
    pub fn event_by_label(&self, label: &str, eligibility: Eligibility<'_, '_>) -> Option<Arc<Event>> {
        self.events
            .iter()
            .chain(self.timeouts.iter())
            .filter(|e| e.label() == label)
            .find(|e| match eligibility {
                Eligibility::Role(role) => e.is_role_valid(role),
                Eligibility::Context(ctx) => e.is_valid(ctx),
            })
            .cloned()
    }

    /// The single event leading to `target` that the role may use.
    pub fn guess_event(&self, target: &str, role: Option<&str>) -> Result<Arc<Event>, CoreError> {
        let mut candidates: Vec<Arc<Event>> = self
            .events_targeting(target)
            .into_iter()
            .filter(|e| e.is_role_valid(role))
            .collect();

        let reason = match candidates.len() {
            1 => return Ok(candidates.remove(0)),
            0 => "no suitable event",
            _ => "too many candidates",
        };
        Err(CoreError::CannotGuessEvent {
            from: self.value.clone(),
            target: target.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn enter_commands(&self) -> Result<Commands, CoreError> {
        self.commands(&self.enter, &self.enter_commands)
    }

    pub fn exit_commands(&self) -> Result<Commands, CoreError> {
        self.commands(&self.exit, &self.exit_commands)
    }

    /// Short type names of the entry commands, for display.
    pub fn enter_command_names(&self) -> Vec<String> {
        component_names(&self.enter)
    }

    pub fn exit_command_names(&self) -> Vec<String> {
        component_names(&self.exit)
    }

    fn commands(
        &self,
        nodes: &[ComponentNode],
        cache: &RwLock<Option<Commands>>,
    ) -> Result<Commands, CoreError> {
        if let Some(commands) = cache.read().as_ref() {
            return Ok(Arc::clone(commands));
        }

        let built = nodes
            .iter()
            .map(|node| self.resolver.command(node))
            .collect::<Result<Vec<_>, _>>()?;
        let built: Commands = built.into();

        let mut slot = cache.write();
        let commands = slot.get_or_insert(built);
        tracing::debug!(
            machine = %self.machine,
            state = %self.value,
            count = commands.len(),
            "Resolved commands"
        );
        Ok(Arc::clone(commands))
    }
}

fn component_names(nodes: &[ComponentNode]) -> Vec<String> {
    nodes
        .iter()
        .map(|node| {
            node.type_name
                .as_deref()
                .or(node.tag.as_deref())
                .map(short_name)
                .unwrap_or("?")
                .to_string()
        })
        .collect()
}
