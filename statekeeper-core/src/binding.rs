//! Trigger dispatch for one machine attached to one subject attribute.

use crate::context::Context;
use crate::error::CoreError;
use crate::event::Event;
use crate::machine::StateMachine;
use crate::state::{Eligibility, State};
use crate::store::AuditEntry;
use crate::subject::{value_as_state, Identity, Subject};
use std::sync::Arc;

/// An event named by label or given directly.
#[derive(Debug, Clone)]
pub enum EventRef<'e> {
    Label(&'e str),
    Event(Arc<Event>),
}

impl<'e> From<&'e str> for EventRef<'e> {
    fn from(label: &'e str) -> Self {
        EventRef::Label(label)
    }
}

impl From<Arc<Event>> for EventRef<'_> {
    fn from(event: Arc<Event>) -> Self {
        EventRef::Event(event)
    }
}

/// Attaches a machine to the attribute `attribute` of a subject type.
///
/// `virtual_attribute` is the public name the attribute is exposed under;
/// errors and scheduled timeouts are keyed by it.
#[derive(Debug, Clone)]
pub struct Binding {
    machine: Arc<StateMachine>,
    attribute: String,
    virtual_attribute: String,
}

impl Binding {
    pub fn new(machine: Arc<StateMachine>, attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self {
            machine,
            virtual_attribute: attribute.clone(),
            attribute,
        }
    }

    pub fn with_virtual_attribute(mut self, name: impl Into<String>) -> Self {
        self.virtual_attribute = name.into();
        self
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn virtual_attribute(&self) -> &str {
        &self.virtual_attribute
    }

    pub fn create_context<'a>(
        &'a self,
        subject: &'a mut dyn Subject,
        identity: Option<&Identity>,
    ) -> Context<'a> {
        Context::new(
            &self.machine,
            subject,
            identity,
            self.attribute.as_str(),
            self.virtual_attribute.as_str(),
        )
    }

    /// The stored state, or the initial state before first entry.
    pub fn current_state(&self, subject: &dyn Subject) -> Result<Arc<State>, CoreError> {
        let value = subject
            .get(&self.attribute)
            .as_ref()
            .and_then(value_as_state)
            .unwrap_or_default();
        self.machine.state(&value)
    }

    /// Fires an event on the subject.
    ///
    /// A label is looked up from the current state with conditions evaluated;
    /// no eligible match is `EventNotFound`. Failures during the transition
    /// are not returned: they are left on the context and copied to the
    /// subject as errors on the virtual attribute.
    pub fn trigger<'a, 'e>(
        &'a self,
        subject: &'a mut dyn Subject,
        event: impl Into<EventRef<'e>>,
        identity: Option<&Identity>,
    ) -> Result<Context<'a>, CoreError> {
        let mut ctx = self.create_context(subject, identity);
        let event = match event.into() {
            EventRef::Event(event) => event,
            EventRef::Label(label) => {
                let state = ctx.current_state()?;
                state
                    .event_by_label(label, Eligibility::Context(&ctx))
                    .ok_or_else(|| CoreError::EventNotFound {
                        machine: self.machine.name().to_string(),
                        event: label.to_string(),
                        role: ctx.role().unwrap_or("*").to_string(),
                    })?
            }
        };

        if let Err(e) = self.machine.transition(&event, &mut ctx) {
            tracing::warn!(
                machine = %self.machine.name(),
                model_pk = %ctx.model_pk(),
                event = %event.label(),
                error = %e,
                "Transition failed"
            );
        }
        ctx.migrate_errors();
        Ok(ctx)
    }

    /// Puts the subject into the initial state.
    pub fn init<'a>(
        &'a self,
        subject: &'a mut dyn Subject,
        identity: Option<&Identity>,
    ) -> Result<Context<'a>, CoreError> {
        let mut ctx = self.create_context(subject, identity);
        if let Err(e) = self.machine.init_attribute(&mut ctx) {
            tracing::warn!(
                machine = %self.machine.name(),
                model_pk = %ctx.model_pk(),
                error = %e,
                "Initialization failed"
            );
        }
        ctx.migrate_errors();
        Ok(ctx)
    }

    /// Moves the subject to `target` through the single event that leads
    /// there.
    ///
    /// Returns `Ok(None)` when the value is unchanged. A subject without a
    /// state may only be set to the initial value.
    pub fn set_value<'a>(
        &'a self,
        subject: &'a mut dyn Subject,
        target: &str,
        identity: Option<&Identity>,
    ) -> Result<Option<Context<'a>>, CoreError> {
        let current = subject.get(&self.attribute).as_ref().and_then(value_as_state);
        let wanted = Some(target).filter(|t| !t.is_empty());
        if current.as_deref() == wanted {
            return Ok(None);
        }

        let current = match current {
            Some(current) => current,
            None => {
                let initial = self.machine.initial_state_value()?;
                if target != initial {
                    return Err(CoreError::InvalidValue {
                        attribute: self.virtual_attribute.clone(),
                        reason: format!(
                            "a new subject must enter '{}' first, got '{}'",
                            initial, target
                        ),
                    });
                }
                return self.init(subject, identity).map(Some);
            }
        };

        let role = identity.and_then(|id| subject.role_for(id));
        let event = self
            .machine
            .state(&current)?
            .guess_event(target, role.as_deref())?;
        self.trigger(subject, event, identity).map(Some)
    }

    /// Events the identity's role is offered from the current state.
    pub fn triggers(
        &self,
        subject: &dyn Subject,
        identity: Option<&Identity>,
    ) -> Result<Vec<Arc<Event>>, CoreError> {
        let role = identity.and_then(|id| subject.role_for(id));
        Ok(self.current_state(subject)?.events(role.as_deref()))
    }

    /// Most recent audit entry of the subject's attribute.
    pub fn last_journal_entry(&self, subject: &dyn Subject) -> Result<Option<AuditEntry>, CoreError> {
        match self.machine.journal() {
            Some(journal) => journal.last_entry_of(
                subject.model_type(),
                &subject.primary_key().to_string(),
                &self.attribute,
            ),
            None => Ok(None),
        }
    }
}
