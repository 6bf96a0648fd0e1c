//! Scheduling and cleanup of timeout events.

use crate::context::Context;
use crate::error::CoreError;
use crate::event::Event;
use crate::store::ScheduledTimeout;

impl Event {
    /// Persists a scheduled record for this timeout.
    ///
    /// Expiry is computed from the machine clock at the time of the call.
    /// Nothing is written for deleted subjects or for events that are not
    /// timeouts.
    pub fn register(&self, ctx: &Context<'_>) -> Result<Option<ScheduledTimeout>, CoreError> {
        let spec = match self.timeout() {
            Some(spec) => spec,
            None => return Ok(None),
        };
        if ctx.subject().is_deleted() {
            return Ok(None);
        }

        let machine = ctx.machine();
        let expires_at = spec.expires_at(machine.clock().now());
        let record = ScheduledTimeout::new(ctx.timeout_key(), self.label(), expires_at);
        machine.timeouts().insert(record.clone())?;

        tracing::debug!(
            machine = machine.name(),
            model_pk = %record.model_pk,
            event = self.label(),
            expires_at = %expires_at,
            "Registered timeout"
        );
        Ok(Some(record))
    }

    /// Deletes every scheduled record of the context's subject attribute.
    pub fn clean_up(&self, ctx: &Context<'_>) -> Result<usize, CoreError> {
        let key = ctx.timeout_key();
        let removed = ctx.machine().timeouts().delete_for(&key)?;
        if removed > 0 {
            tracing::debug!(
                machine = %key.machine,
                model_pk = %key.model_pk,
                removed,
                "Cleaned up timeouts"
            );
        }
        Ok(removed)
    }
}
