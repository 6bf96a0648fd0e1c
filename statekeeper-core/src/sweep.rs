//! Firing of due timeouts.

use crate::binding::{Binding, EventRef};
use crate::error::CoreError;
use crate::store::{ScheduledTimeout, TimeoutStore};
use crate::subject::{Subject, SubjectStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What happened to one due timeout.
#[derive(Debug, Clone)]
pub enum FireOutcome {
    /// The event fired and the transition applied.
    Triggered,
    /// The transition was vetoed; the messages are the context errors.
    Rejected(Vec<String>),
    /// Another worker holds the key, or the record is already gone.
    AlreadyHandled,
    /// The subject is missing or deleted; the record was removed.
    Dropped,
    /// No binding handles the record's subject type and attribute.
    Unbound,
    /// The subject's current state no longer declares the event, so the
    /// record can never fire; it was removed.
    Stale,
    Failed(CoreError),
}

#[derive(Debug, Clone)]
pub struct SweepFailure {
    pub timeout_id: Uuid,
    pub model: String,
    pub model_pk: String,
    pub event: String,
    pub error: String,
}

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub due: usize,
    pub triggered: usize,
    pub rejected: usize,
    pub already_handled: usize,
    pub dropped: usize,
    pub unbound: usize,
    pub stale: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.rejected == 0 && self.unbound == 0
    }
}

/// Fires due timeouts through the bindings registered for their subject
/// types.
pub struct Sweeper {
    timeouts: Arc<dyn TimeoutStore>,
    subjects: Arc<dyn SubjectStore>,
    bindings: HashMap<(String, String), Arc<Binding>>,
}

impl Sweeper {
    pub fn new(timeouts: Arc<dyn TimeoutStore>, subjects: Arc<dyn SubjectStore>) -> Self {
        Self {
            timeouts,
            subjects,
            bindings: HashMap::new(),
        }
    }

    /// Routes timeouts of `model` scheduled under the binding's virtual
    /// attribute to the binding.
    pub fn bind(&mut self, model: impl Into<String>, binding: Arc<Binding>) {
        let key = (model.into(), binding.virtual_attribute().to_string());
        self.bindings.insert(key, binding);
    }

    pub fn with_binding(mut self, model: impl Into<String>, binding: Arc<Binding>) -> Self {
        self.bind(model, binding);
        self
    }

    pub fn binding(&self, model: &str, virtual_attribute: &str) -> Option<&Arc<Binding>> {
        self.bindings
            .get(&(model.to_string(), virtual_attribute.to_string()))
    }

    pub fn pending_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimeout>, CoreError> {
        self.timeouts.pending(now)
    }

    /// Fires every timeout due at `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        let due = self.pending_timeouts(now)?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };

        for record in &due {
            let outcome = self.fire(record).unwrap_or_else(FireOutcome::Failed);
            match outcome {
                FireOutcome::Triggered => report.triggered += 1,
                FireOutcome::Rejected(errors) => {
                    tracing::warn!(
                        model = %record.model,
                        model_pk = %record.model_pk,
                        event = %record.event,
                        errors = ?errors,
                        "Timeout transition rejected"
                    );
                    report.rejected += 1;
                }
                FireOutcome::AlreadyHandled => report.already_handled += 1,
                FireOutcome::Dropped => report.dropped += 1,
                FireOutcome::Unbound => report.unbound += 1,
                FireOutcome::Stale => report.stale += 1,
                FireOutcome::Failed(e) => {
                    tracing::warn!(
                        model = %record.model,
                        model_pk = %record.model_pk,
                        event = %record.event,
                        error = %e,
                        "Timeout failed"
                    );
                    report.failures.push(SweepFailure {
                        timeout_id: record.id,
                        model: record.model.clone(),
                        model_pk: record.model_pk.clone(),
                        event: record.event.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                triggered = report.triggered,
                rejected = report.rejected,
                dropped = report.dropped,
                stale = report.stale,
                failed = report.failures.len(),
                "Sweep completed"
            );
        }
        Ok(report)
    }

    /// Claims and fires one timeout.
    pub fn fire(&self, record: &ScheduledTimeout) -> Result<FireOutcome, CoreError> {
        let _claim = match self.timeouts.claim(record)? {
            Some(claim) => claim,
            None => return Ok(FireOutcome::AlreadyHandled),
        };

        let primary_key: Value = serde_json::from_str(&record.model_pk)?;
        let mut subject = match self.subjects.load(&record.model, &primary_key)? {
            Some(subject) if !subject.is_deleted() => subject,
            _ => {
                self.timeouts.delete(record.id)?;
                tracing::warn!(
                    model = %record.model,
                    model_pk = %record.model_pk,
                    event = %record.event,
                    "Dropped timeout of missing subject"
                );
                return Ok(FireOutcome::Dropped);
            }
        };

        let binding = match self.binding(&record.model, &record.virtual_attribute) {
            Some(binding) if binding.machine().name() == record.machine => binding,
            _ => return Ok(FireOutcome::Unbound),
        };

        let fired = match binding.trigger(subject.as_mut(), EventRef::Label(&record.event), None) {
            Ok(ctx) => Some(if let Some(e) = ctx.exceptions().first() {
                FireOutcome::Failed(e.clone())
            } else if ctx.has_errors() {
                FireOutcome::Rejected(ctx.errors().to_vec())
            } else {
                FireOutcome::Triggered
            }),
            Err(CoreError::EventNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        match fired {
            Some(outcome) => Ok(outcome),
            None => self.unmatched(record, binding, subject.as_ref()),
        }
    }

    /// A due record whose event did not match. Records whose label the
    /// current state does not declare at all are removed; a declared but
    /// ineligible event is a rejection and is retried on the next pass.
    fn unmatched(
        &self,
        record: &ScheduledTimeout,
        binding: &Binding,
        subject: &dyn Subject,
    ) -> Result<FireOutcome, CoreError> {
        let state = binding.current_state(subject)?;
        let declared = state
            .timeouts()
            .iter()
            .chain(state.events(None).iter())
            .any(|event| event.label() == record.event);
        if declared {
            return Ok(FireOutcome::Rejected(vec![format!(
                "event '{}' is not eligible in state '{}'",
                record.event,
                state.value()
            )]));
        }

        self.timeouts.delete(record.id)?;
        tracing::warn!(
            model = %record.model,
            model_pk = %record.model_pk,
            event = %record.event,
            state = %state.value(),
            "Dropped stale timeout"
        );
        Ok(FireOutcome::Stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_machine_with, Document, DocumentStore};
    use crate::store::{MemoryJournal, MemoryTimeoutStore};
    use chrono::Duration;
    use serde_json::json;

    struct Setup {
        timeouts: Arc<MemoryTimeoutStore>,
        journal: Arc<MemoryJournal>,
        documents: DocumentStore,
        binding: Arc<Binding>,
        sweeper: Sweeper,
    }

    fn setup() -> Setup {
        let timeouts = Arc::new(MemoryTimeoutStore::new());
        let journal = Arc::new(MemoryJournal::new());
        let machine = sample_machine_with(|b| {
            b.with_timeout_store(timeouts.clone())
                .with_journal(journal.clone())
        });
        let binding = Arc::new(Binding::new(Arc::new(machine), "status"));
        let documents = DocumentStore::new();
        let sweeper = Sweeper::new(timeouts.clone(), Arc::new(documents.clone()))
            .with_binding("document", binding.clone());
        Setup {
            timeouts,
            journal,
            documents,
            binding,
            sweeper,
        }
    }

    /// Puts document `id` in review through the binding, scheduling its
    /// timeout.
    fn enter_review(setup: &Setup, id: i64) {
        setup
            .documents
            .insert(Document::new(id).with("status", json!("draft")));
        let mut handle = setup.documents.handle(id);
        let ctx = setup.binding.trigger(&mut handle, "fast_track", None).unwrap();
        assert!(!ctx.has_errors());
    }

    #[test]
    fn test_sweep_fires_due_timeouts() {
        let setup = setup();
        enter_review(&setup, 1);

        let later = Utc::now() + Duration::days(2);
        assert_eq!(setup.sweeper.pending_timeouts(Utc::now()).unwrap().len(), 0);
        assert_eq!(setup.sweeper.pending_timeouts(later).unwrap().len(), 1);

        let report = setup.sweeper.sweep(later).unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.triggered, 1);
        assert!(report.is_clean());
        assert_eq!(setup.documents.get(1).attr("status"), json!("draft"));
        assert!(setup.timeouts.is_empty());

        let second = setup.sweeper.sweep(later).unwrap();
        assert_eq!(second.due, 0);
    }

    #[test]
    fn test_missing_subject_drops_record() {
        let setup = setup();
        enter_review(&setup, 1);
        setup.documents.remove(1);

        let report = setup.sweeper.sweep(Utc::now() + Duration::days(2)).unwrap();
        assert_eq!(report.dropped, 1);
        assert!(setup.timeouts.is_empty());
    }

    #[test]
    fn test_deleted_subject_drops_record() {
        let setup = setup();
        enter_review(&setup, 1);
        setup.documents.mark_deleted(1);

        let report = setup.sweeper.sweep(Utc::now() + Duration::days(2)).unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.triggered, 0);
        assert_eq!(setup.documents.get(1).attr("status"), json!("review"));
    }

    #[test]
    fn test_unbound_record_left_in_place() {
        let setup = setup();
        enter_review(&setup, 1);
        let sweeper = Sweeper::new(setup.timeouts.clone(), Arc::new(setup.documents.clone()));

        let report = sweeper.sweep(Utc::now() + Duration::days(2)).unwrap();
        assert_eq!(report.unbound, 1);
        assert_eq!(setup.timeouts.len(), 1);
    }

    #[test]
    fn test_stale_record_removed() {
        let setup = setup();
        enter_review(&setup, 1);
        // Moved on outside the engine; published declares no `expire`.
        setup
            .documents
            .insert(Document::new(1).with("status", json!("published")));

        let later = Utc::now() + Duration::days(2);
        let report = setup.sweeper.sweep(later).unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.stale, 1);
        assert!(report.failures.is_empty());
        assert!(setup.timeouts.is_empty());
        assert_eq!(setup.documents.get(1).attr("status"), json!("published"));

        assert_eq!(setup.sweeper.sweep(later).unwrap().due, 0);
    }

    #[test]
    fn test_claimed_record_is_skipped() {
        let setup = setup();
        enter_review(&setup, 1);
        let record = setup.timeouts.all().remove(0);
        let claim = setup.timeouts.claim(&record).unwrap().unwrap();

        assert!(matches!(
            setup.sweeper.fire(&record).unwrap(),
            FireOutcome::AlreadyHandled
        ));
        drop(claim);
        assert!(matches!(
            setup.sweeper.fire(&record).unwrap(),
            FireOutcome::Triggered
        ));
    }

    #[test]
    fn test_concurrent_sweeps_fire_once() {
        let setup = Arc::new(setup());
        for id in 1..=5 {
            enter_review(&setup, id);
        }
        let entries_before = setup.journal.entries().len();
        let later = Utc::now() + Duration::days(2);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let setup = Arc::clone(&setup);
                std::thread::spawn(move || setup.sweeper.sweep(later).unwrap())
            })
            .collect();
        let reports: Vec<SweepReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let triggered: usize = reports.iter().map(|r| r.triggered).sum();
        assert_eq!(triggered, 5);
        assert!(reports.iter().all(|r| r.failures.is_empty()));
        assert_eq!(setup.journal.entries().len(), entries_before + 5);
        for id in 1..=5 {
            assert_eq!(setup.documents.get(id).attr("status"), json!("draft"));
        }
    }
}
