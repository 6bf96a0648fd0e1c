//! State machines: lazy schema loading and memoized state resolution.

use crate::clock::{Clock, SystemClock};
use crate::condition::Authorizer;
use crate::error::CoreError;
use crate::registry::{Registry, Resolver, DEFAULT_COMMANDS_NAMESPACE, DEFAULT_CONDITIONS_NAMESPACE};
use crate::schema::{MachineSchema, SchemaSource};
use crate::state::State;
use crate::store::{AuditJournal, MemoryTimeoutStore, TimeoutStore, TransactionManager};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A named machine bound to a schema source and its collaborators.
///
/// The schema is loaded on first access. States are built on first lookup
/// and cached for the lifetime of the machine.
pub struct StateMachine {
    name: String,
    source: SchemaSource,
    resolver: Arc<Resolver>,
    timeouts: Arc<dyn TimeoutStore>,
    journal: Option<Arc<dyn AuditJournal>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    clock: Arc<dyn Clock>,
    schema: RwLock<Option<Arc<MachineSchema>>>,
    states: DashMap<String, Arc<State>>,
}

impl StateMachine {
    pub fn builder(name: impl Into<String>, source: impl Into<SchemaSource>) -> StateMachineBuilder {
        StateMachineBuilder::new(name, source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &SchemaSource {
        &self.source
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn timeouts(&self) -> &Arc<dyn TimeoutStore> {
        &self.timeouts
    }

    pub fn journal(&self) -> Option<&Arc<dyn AuditJournal>> {
        self.journal.as_ref()
    }

    pub fn transactions(&self) -> Option<&Arc<dyn TransactionManager>> {
        self.transactions.as_ref()
    }

    pub fn authorizer(&self) -> Option<&dyn Authorizer> {
        self.authorizer.as_deref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The machine's schema, loaded on first call.
    pub fn schema(&self) -> Result<Arc<MachineSchema>, CoreError> {
        if let Some(schema) = self.schema.read().as_ref() {
            return Ok(Arc::clone(schema));
        }

        let loaded = Arc::new(self.source.load(&self.name)?);
        tracing::debug!(
            machine = %self.name,
            states = loaded.states.len(),
            "Loaded schema"
        );
        let mut slot = self.schema.write();
        Ok(Arc::clone(slot.get_or_insert(loaded)))
    }

    pub fn initial_state_value(&self) -> Result<String, CoreError> {
        self.schema()?
            .initial_state
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                CoreError::invalid_schema(format!(
                    "machine '{}' has no initial state",
                    self.name
                ))
            })
    }

    /// Resolves a state by value. An empty value means the initial state.
    pub fn state(&self, value: &str) -> Result<Arc<State>, CoreError> {
        let value = if value.is_empty() {
            self.initial_state_value()?
        } else {
            value.to_string()
        };

        if let Some(state) = self.states.get(&value) {
            return Ok(Arc::clone(state.value()));
        }

        let schema = self.schema()?;
        let mut declared = schema.states.iter().filter(|s| s.value == value);
        let declared = match (declared.next(), declared.next()) {
            (Some(state), None) => state,
            (None, _) => {
                return Err(CoreError::StateNotFound {
                    machine: self.name.clone(),
                    state: value,
                })
            }
            (Some(_), Some(_)) => {
                return Err(CoreError::invalid_schema(format!(
                    "state '{}' is declared more than once in machine '{}'",
                    value, self.name
                )))
            }
        };

        let initial = schema.initial_state.as_deref() == Some(value.as_str());
        let state = Arc::new(State::build(
            &self.name,
            declared,
            initial,
            Arc::clone(&self.resolver),
        )?);
        tracing::debug!(machine = %self.name, state = %value, "Resolved state");

        // Another thread may have built the same state meanwhile; the first
        // insertion is kept.
        let entry = self.states.entry(value).or_insert(state);
        Ok(Arc::clone(entry.value()))
    }

    pub fn initial_state(&self) -> Result<Arc<State>, CoreError> {
        self.state("")
    }

    /// Every declared state, in declaration order.
    pub fn states(&self) -> Result<Vec<Arc<State>>, CoreError> {
        self.schema()?
            .states
            .iter()
            .map(|s| self.state(&s.value))
            .collect()
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("resolved_states", &self.states.len())
            .field("journal", &self.journal.is_some())
            .field("transactions", &self.transactions.is_some())
            .finish()
    }
}

/// Builder for [`StateMachine`].
pub struct StateMachineBuilder {
    name: String,
    source: SchemaSource,
    registry: Option<Arc<Registry>>,
    commands_namespace: String,
    conditions_namespace: String,
    infer_type_from_tag: bool,
    timeouts: Option<Arc<dyn TimeoutStore>>,
    journal: Option<Arc<dyn AuditJournal>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    clock: Option<Arc<dyn Clock>>,
}

impl StateMachineBuilder {
    pub fn new(name: impl Into<String>, source: impl Into<SchemaSource>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            registry: None,
            commands_namespace: DEFAULT_COMMANDS_NAMESPACE.to_string(),
            conditions_namespace: DEFAULT_CONDITIONS_NAMESPACE.to_string(),
            infer_type_from_tag: false,
            timeouts: None,
            journal: None,
            transactions: None,
            authorizer: None,
            clock: None,
        }
    }

    /// Defaults to a registry holding the built-in components.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_commands_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.commands_namespace = namespace.into();
        self
    }

    pub fn with_conditions_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.conditions_namespace = namespace.into();
        self
    }

    pub fn with_infer_type_from_tag(mut self, infer: bool) -> Self {
        self.infer_type_from_tag = infer;
        self
    }

    /// Defaults to an in-memory store.
    pub fn with_timeout_store(mut self, store: Arc<dyn TimeoutStore>) -> Self {
        self.timeouts = Some(store);
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn AuditJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_transactions(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> StateMachine {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(Registry::with_builtins()));
        let resolver = Resolver::new(registry, self.name.clone())
            .with_namespaces(self.commands_namespace, self.conditions_namespace)
            .with_infer_type_from_tag(self.infer_type_from_tag);

        StateMachine {
            name: self.name,
            source: self.source,
            resolver: Arc::new(resolver),
            timeouts: self
                .timeouts
                .unwrap_or_else(|| Arc::new(MemoryTimeoutStore::new())),
            journal: self.journal,
            transactions: self.transactions,
            authorizer: self.authorizer,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            schema: RwLock::new(None),
            states: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_machine_with, SAMPLE_SCHEMA};
    use crate::schema::SchemaDocument;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_value_means_initial() {
        let machine = sample_machine_with(|b| b);
        let initial = machine.state("").unwrap();
        assert_eq!(initial.value(), "draft");
        assert!(Arc::ptr_eq(&initial, &machine.state("draft").unwrap()));
    }

    #[test]
    fn test_states_in_declaration_order() {
        let machine = sample_machine_with(|b| b);
        let values: Vec<String> = machine
            .states()
            .unwrap()
            .iter()
            .map(|s| s.value().to_string())
            .collect();
        assert_eq!(values, vec!["draft", "review", "published"]);
        assert_eq!(
            machine.states().unwrap().iter().filter(|s| s.is_initial()).count(),
            1
        );
    }

    #[test]
    fn test_unknown_state() {
        let machine = sample_machine_with(|b| b);
        let err = machine.state("archived").unwrap_err();
        assert_eq!(err.error_code(), "STATE_NOT_FOUND");
    }

    #[test]
    fn test_duplicate_state_value() {
        let doc = SchemaDocument::from_yaml(
            r#"
state_machines:
  - name: dup
    initial_state: a
    states:
      - value: a
      - value: a
"#,
        )
        .unwrap();
        let machine = StateMachine::builder("dup", doc).build();
        assert!(matches!(
            machine.state("a").unwrap_err(),
            CoreError::InvalidSchema { .. }
        ));
    }

    #[test]
    fn test_missing_initial_state() {
        let doc = SchemaDocument::from_yaml(
            "state_machines:\n  - name: bare\n    states:\n      - value: a\n",
        )
        .unwrap();
        let machine = StateMachine::builder("bare", doc).build();
        assert!(machine.initial_state_value().is_err());
        assert!(machine.state("").is_err());
        assert!(!machine.state("a").unwrap().is_initial());
    }

    #[test]
    fn test_schema_loaded_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let source = SchemaSource::loader(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            SchemaDocument::from_yaml(SAMPLE_SCHEMA)
        });
        let machine = StateMachine::builder("publishing", source).build();
        machine.states().unwrap();
        machine.state("review").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_machine() {
        let doc = SchemaDocument::from_yaml(SAMPLE_SCHEMA).unwrap();
        let machine = StateMachine::builder("invoice", doc).build();
        assert_eq!(
            machine.state("draft").unwrap_err().error_code(),
            "STATE_MACHINE_NOT_FOUND"
        );
    }

    #[test]
    fn test_concurrent_resolution_yields_one_instance() {
        let machine = Arc::new(sample_machine_with(|b| b));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&machine);
                std::thread::spawn(move || machine.state("review").unwrap())
            })
            .collect();
        let states: Vec<Arc<State>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(states.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
