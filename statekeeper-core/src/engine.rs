//! Transition engine.
//!
//! A transition runs, in order: the source state's exit commands, cleanup of
//! scheduled timeouts, the attribute write, the target state's enter
//! commands, registration of the target's timeouts and the journal append.
//! When the machine has a transaction manager the whole sequence commits or
//! rolls back as one unit.

use crate::command::Command;
use crate::context::Context;
use crate::error::CoreError;
use crate::event::Event;
use crate::machine::StateMachine;
use crate::state::State;
use crate::store::AuditEntry;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

impl StateMachine {
    // =========================================================================
    // Public entry points
    // =========================================================================

    /// Moves the subject along `event`.
    ///
    /// Returns `Ok(false)` when a command vetoed the move; the veto is
    /// recorded as an error on the context. Hard failures are attached to the
    /// context and returned.
    pub fn transition(&self, event: &Arc<Event>, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        ctx.set_event(Arc::clone(event));
        self.guarded(ctx, |ctx| self.apply_transition(event, ctx))
    }

    /// Puts a subject into the initial state for the first time.
    pub fn init_attribute(&self, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        self.guarded(ctx, |ctx| self.apply_init(ctx))
    }

    // =========================================================================
    // Transaction handling
    // =========================================================================

    fn guarded<F>(&self, ctx: &mut Context<'_>, step: F) -> Result<bool, CoreError>
    where
        F: FnOnce(&mut Context<'_>) -> Result<bool, CoreError>,
    {
        let attr = ctx.attribute().to_string();
        let previous = ctx.subject().get(&attr);

        let tx = match self.transactions() {
            Some(manager) => match manager.begin() {
                Ok(tx) => Some(tx),
                Err(e) => {
                    ctx.attach_exception(e.clone());
                    return Err(e);
                }
            },
            None => None,
        };

        let outcome = step(ctx);
        let tx = match tx {
            Some(tx) => tx,
            None => {
                if let Err(e) = &outcome {
                    ctx.attach_exception(e.clone());
                }
                return outcome;
            }
        };

        let result = match outcome {
            Ok(true) => tx.commit().map(|_| true),
            Ok(false) => tx.rollback().map(|_| false),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(machine = %self.name(), error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        };

        match result {
            Ok(true) => Ok(true),
            Ok(false) => {
                restore(ctx, &attr, previous);
                Ok(false)
            }
            Err(e) => {
                restore(ctx, &attr, previous);
                ctx.attach_exception(e.clone());
                Err(e)
            }
        }
    }

    // =========================================================================
    // Steps
    // =========================================================================

    fn apply_transition(&self, event: &Arc<Event>, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        let source = self.state(event.source())?;
        let target = event.target_state(self)?;

        if !self.run_commands(&source.exit_commands()?, ctx)? {
            return Ok(false);
        }

        event.clean_up(ctx)?;
        self.write_attribute(ctx, &target)?;

        if !ctx.subject().is_deleted() && !self.run_commands(&target.enter_commands()?, ctx)? {
            return Ok(false);
        }

        self.register_timeouts(ctx, &target)?;
        self.append_journal(ctx, Some(event.label()), Some(source.value()), target.value())?;

        tracing::info!(
            machine = %self.name(),
            model = %ctx.subject().model_type(),
            model_pk = %ctx.model_pk(),
            from = %source.value(),
            to = %target.value(),
            event = %event.label(),
            "Transition applied"
        );
        Ok(true)
    }

    fn apply_init(&self, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        let initial = self.initial_state()?;
        let attr = ctx.attribute().to_string();
        ctx.subject_mut()
            .set(&attr, Value::String(initial.value().to_string()));

        if !ctx.subject().is_deleted() && !self.run_commands(&initial.enter_commands()?, ctx)? {
            return Ok(false);
        }

        ctx.subject_mut().save(&[attr.as_str()])?;
        self.register_timeouts(ctx, &initial)?;
        self.append_journal(ctx, None, None, initial.value())?;

        tracing::info!(
            machine = %self.name(),
            model = %ctx.subject().model_type(),
            model_pk = %ctx.model_pk(),
            state = %initial.value(),
            "Attribute initialized"
        );
        Ok(true)
    }

    fn run_commands(
        &self,
        commands: &[Arc<dyn Command>],
        ctx: &mut Context<'_>,
    ) -> Result<bool, CoreError> {
        for command in commands {
            tracing::debug!(machine = %self.name(), command = command.name(), "Executing command");
            if !command.execute(ctx)? {
                tracing::warn!(
                    machine = %self.name(),
                    model_pk = %ctx.model_pk(),
                    command = command.name(),
                    "Command vetoed transition"
                );
                ctx.add_error(format!("command '{}' vetoed the transition", command.name()));
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_attribute(&self, ctx: &mut Context<'_>, target: &State) -> Result<(), CoreError> {
        let attr = ctx.attribute().to_string();
        let subject = ctx.subject_mut();
        subject.set(&attr, Value::String(target.value().to_string()));
        subject.save(&[attr.as_str()])
    }

    fn register_timeouts(&self, ctx: &Context<'_>, state: &State) -> Result<(), CoreError> {
        for timeout in state.timeouts() {
            timeout.register(ctx)?;
        }
        Ok(())
    }

    fn append_journal(
        &self,
        ctx: &Context<'_>,
        event: Option<&str>,
        from: Option<&str>,
        to: &str,
    ) -> Result<(), CoreError> {
        let journal = match self.journal() {
            Some(journal) => journal,
            None => return Ok(()),
        };

        journal.append(AuditEntry {
            id: Uuid::new_v4(),
            model: ctx.subject().model_type().to_string(),
            model_pk: ctx.model_pk(),
            machine: self.name().to_string(),
            attribute: ctx.attribute().to_string(),
            identity: ctx.identity().map(|id| id.to_string()),
            event: event.filter(|e| !e.is_empty()).map(str::to_string),
            from_state: from.map(str::to_string),
            to_state: to.to_string(),
            created_at: self.clock().now(),
        })
    }
}

fn restore(ctx: &mut Context<'_>, attr: &str, previous: Option<Value>) {
    ctx.subject_mut().set(attr, previous.unwrap_or(Value::Null));
}
