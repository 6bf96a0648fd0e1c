//! Per-trigger transition context.

use crate::error::CoreError;
use crate::event::Event;
use crate::machine::StateMachine;
use crate::state::State;
use crate::store::TimeoutKey;
use crate::subject::{value_as_state, Identity, Subject};
use std::fmt;
use std::sync::Arc;

/// Everything one trigger attempt reads and accumulates.
///
/// Built per attempt and dropped afterwards. Events processed during the
/// attempt are stacked; the most recent one is [`Context::event`].
pub struct Context<'a> {
    machine: &'a StateMachine,
    subject: &'a mut dyn Subject,
    identity: Option<Identity>,
    role: Option<String>,
    attr: String,
    virt_attr: String,
    events: Vec<Arc<Event>>,
    errors: Vec<String>,
    exceptions: Vec<CoreError>,
}

impl<'a> Context<'a> {
    /// Creates a context. The role is looked up on the subject for the
    /// identity.
    pub fn new(
        machine: &'a StateMachine,
        subject: &'a mut dyn Subject,
        identity: Option<&Identity>,
        attr: impl Into<String>,
        virt_attr: impl Into<String>,
    ) -> Self {
        let role = identity.and_then(|id| subject.role_for(id));
        Self {
            machine,
            subject,
            identity: identity.cloned(),
            role,
            attr: attr.into(),
            virt_attr: virt_attr.into(),
            events: Vec::new(),
            errors: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    /// Overrides the resolved role.
    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    pub fn machine(&self) -> &'a StateMachine {
        self.machine
    }

    pub fn subject(&self) -> &dyn Subject {
        &*self.subject
    }

    pub fn subject_mut(&mut self) -> &mut dyn Subject {
        &mut *self.subject
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Storage name of the controlled attribute.
    pub fn attribute(&self) -> &str {
        &self.attr
    }

    /// Public name of the controlled attribute; errors are reported under it.
    pub fn virtual_attribute(&self) -> &str {
        &self.virt_attr
    }

    /// Compact JSON of the subject's primary key, keys sorted.
    pub fn model_pk(&self) -> String {
        self.subject.primary_key().to_string()
    }

    pub fn timeout_key(&self) -> TimeoutKey {
        TimeoutKey {
            model: self.subject.model_type().to_string(),
            model_pk: self.model_pk(),
            virtual_attribute: self.virt_attr.clone(),
            machine: self.machine.name().to_string(),
        }
    }

    /// Pushes an event. Pushing the current event again is a no-op.
    pub fn set_event(&mut self, event: Arc<Event>) {
        if let Some(last) = self.events.last() {
            if Arc::ptr_eq(last, &event) {
                return;
            }
        }
        self.events.push(event);
    }

    pub fn event(&self) -> Option<&Arc<Event>> {
        self.events.last()
    }

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Records a failure and its message.
    pub fn attach_exception(&mut self, error: CoreError) {
        self.errors.push(error.to_string());
        self.exceptions.push(error);
    }

    pub fn exceptions(&self) -> &[CoreError] {
        &self.exceptions
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || !self.exceptions.is_empty()
    }

    pub fn has_exception(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// The attribute's stored state value, `None` before first entry.
    pub fn current_value(&self) -> Option<String> {
        self.subject
            .get(&self.attr)
            .as_ref()
            .and_then(value_as_state)
    }

    /// Current state, or the initial state before first entry.
    pub fn current_state(&self) -> Result<Arc<State>, CoreError> {
        self.machine
            .state(self.current_value().as_deref().unwrap_or_default())
    }

    /// Events from the current state valid for this context.
    pub fn possible_events(&self) -> Result<Vec<Arc<Event>>, CoreError> {
        Ok(self.current_state()?.eligible_events(self))
    }

    /// Copies accumulated errors to the subject under the virtual attribute.
    pub fn migrate_errors(&mut self) {
        for message in &self.errors {
            self.subject.add_error(&self.virt_attr, message.clone());
        }
    }

    /// `Err(Transition)` when anything went wrong.
    pub fn into_result(self) -> Result<(), CoreError> {
        if !self.has_errors() {
            return Ok(());
        }
        Err(CoreError::Transition {
            reason: self.errors.join("; "),
        })
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<&str> = self.events.iter().map(|e| e.label()).collect();
        f.debug_struct("Context")
            .field("machine", &self.machine.name())
            .field("attribute", &self.attr)
            .field("virtual_attribute", &self.virt_attr)
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("events", &events)
            .field("errors", &self.errors)
            .field("exceptions", &self.exceptions)
            .finish()
    }
}
