//! Events: labelled edges between states.

use crate::condition::Condition;
use crate::context::Context;
use crate::error::CoreError;
use crate::machine::StateMachine;
use crate::registry::Resolver;
use crate::schema::{EventSchema, TimeoutSchema};
use crate::state::State;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Longest accepted timeout offset, in seconds.
const MAX_TIMEOUT_SECONDS: i64 = i64::MAX / 1_000;

/// A directed edge from its source state to a target state value.
#[derive(Debug)]
pub struct Event {
    source: String,
    target: String,
    label: String,
    roles: Vec<String>,
    data: BTreeMap<String, Value>,
    conditions: Vec<Arc<dyn Condition>>,
    timeout: Option<TimeoutSpec>,
}

impl Event {
    pub fn new(source: impl Into<String>, target: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: label.into(),
            roles: Vec::new(),
            data: BTreeMap::new(),
            conditions: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_timeout(mut self, offset: Duration) -> Self {
        self.timeout = Some(TimeoutSpec::new(offset));
        self
    }

    pub(crate) fn from_schema(
        source: &str,
        schema: &EventSchema,
        resolver: &Resolver,
    ) -> Result<Self, CoreError> {
        if schema.target.is_empty() {
            return Err(CoreError::invalid_schema(format!(
                "event '{}' of state '{}' has no target",
                schema.label, source
            )));
        }

        let conditions = schema
            .conditions
            .iter()
            .map(|node| resolver.condition(node))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: source.to_string(),
            target: schema.target.clone(),
            label: schema.label.clone(),
            roles: schema.roles.clone(),
            data: schema.data.clone(),
            conditions,
            timeout: None,
        })
    }

    pub(crate) fn timeout_from_schema(
        source: &str,
        schema: &TimeoutSchema,
        resolver: &Resolver,
    ) -> Result<Self, CoreError> {
        let seconds = schema
            .offset_seconds()
            .filter(|s| (0..=MAX_TIMEOUT_SECONDS).contains(s))
            .ok_or_else(|| {
                CoreError::invalid_schema(format!(
                    "timeout '{}' of state '{}' has an invalid offset",
                    schema.event.label, source
                ))
            })?;

        let mut event = Self::from_schema(source, &schema.event, resolver)?;
        event.timeout = Some(TimeoutSpec::new(Duration::seconds(seconds)));
        Ok(event)
    }

    /// Value of the owning state.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn data_value(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn conditions(&self) -> &[Arc<dyn Condition>] {
        &self.conditions
    }

    pub fn timeout(&self) -> Option<&TimeoutSpec> {
        self.timeout.as_ref()
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout.is_some()
    }

    /// An event that returns to its own source.
    pub fn is_refresh(&self) -> bool {
        self.target == self.source
    }

    /// An absent role, or an event without roles, is always valid.
    pub fn is_role_valid(&self, role: Option<&str>) -> bool {
        match role {
            None => true,
            Some(_) if self.roles.is_empty() => true,
            Some(role) => self.roles.iter().any(|r| r == role),
        }
    }

    /// Every given role must be declared on the event and, with a context,
    /// every condition must pass. An event that declares no roles is not
    /// eligible.
    pub fn is_eligible(&self, roles: &[&str], ctx: Option<&Context<'_>>) -> bool {
        if self.roles.is_empty() {
            return false;
        }
        if !roles.iter().all(|role| self.roles.iter().any(|r| r == role)) {
            return false;
        }
        ctx.map_or(true, |ctx| self.conditions_pass(ctx))
    }

    /// Role check against the context's role, then every condition.
    pub fn is_valid(&self, ctx: &Context<'_>) -> bool {
        self.is_role_valid(ctx.role()) && self.conditions_pass(ctx)
    }

    /// True when the event declares roles and all of them are in `roles`.
    pub fn is_exclusive_to(&self, roles: &[&str]) -> bool {
        !self.roles.is_empty() && self.roles.iter().all(|r| roles.contains(&r.as_str()))
    }

    fn conditions_pass(&self, ctx: &Context<'_>) -> bool {
        self.conditions.iter().all(|condition| {
            let passed = condition.check(ctx);
            if !passed {
                tracing::debug!(
                    event = %self.label,
                    condition = condition.name(),
                    "Condition not met"
                );
            }
            passed
        })
    }

    /// Resolves the target through the machine.
    pub fn target_state(&self, machine: &StateMachine) -> Result<Arc<State>, CoreError> {
        machine.state(&self.target)
    }
}

/// Offset of a timeout event and an optional explicit expiry.
#[derive(Debug)]
pub struct TimeoutSpec {
    offset: Duration,
    expires_override: RwLock<Option<DateTime<Utc>>>,
}

impl TimeoutSpec {
    pub fn new(offset: Duration) -> Self {
        Self {
            offset,
            expires_override: RwLock::new(None),
        }
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// `now + offset`, unless an explicit instant was installed.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = *self.expires_override.read() {
            return at;
        }
        now.checked_add_signed(self.offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn set_expires_at(&self, at: Option<DateTime<Utc>>) {
        *self.expires_override.write() = at;
    }
}
