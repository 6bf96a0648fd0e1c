//! Runtime assembly: storage, machines, bindings and the sweeper.

use crate::authorizer::RoleAuthorizer;
use crate::config::{Config, ConfigError};
use crate::error::RuntimeError;
use statekeeper_core::{
    Binding, Clock, CoreError, Registry, SchemaDocument, SchemaSource, StateMachine, SweepReport,
    Sweeper, SystemClock,
};
use statekeeper_storage::{RecordSubject, Storage, StorageConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of resolving every state of one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSummary {
    pub name: String,
    pub initial_state: String,
    pub states: Vec<String>,
}

/// Everything a host needs to drive state machines over stored records.
pub struct Runtime {
    config: Config,
    storage: Storage,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    machines: BTreeMap<String, Arc<StateMachine>>,
    /// Keyed by model and virtual attribute.
    bindings: BTreeMap<(String, String), Arc<Binding>>,
    sweeper: Arc<Sweeper>,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Builds a runtime from configuration alone.
    pub fn open(config: Config) -> Result<Self, RuntimeError> {
        RuntimeBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    pub fn machine_names(&self) -> Vec<&str> {
        self.machines.keys().map(String::as_str).collect()
    }

    pub fn machine(&self, name: &str) -> Result<&Arc<StateMachine>, CoreError> {
        self.machines
            .get(name)
            .ok_or_else(|| CoreError::StateMachineNotFound {
                machine: name.to_string(),
            })
    }

    /// Bindings as `(model, binding)` pairs.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Arc<Binding>)> {
        self.bindings
            .iter()
            .map(|((model, _), binding)| (model.as_str(), binding))
    }

    /// The binding of `model` for `attribute` (storage or virtual name).
    /// Without an attribute the model must have exactly one binding.
    pub fn binding(&self, model: &str, attribute: Option<&str>) -> Result<&Arc<Binding>, RuntimeError> {
        let mut candidates = self
            .bindings
            .iter()
            .filter(|((m, _), _)| m == model)
            .map(|(_, binding)| binding)
            .filter(|binding| {
                attribute.map_or(true, |attr| {
                    binding.virtual_attribute() == attr || binding.attribute() == attr
                })
            });

        match (candidates.next(), candidates.next()) {
            (Some(binding), None) => Ok(binding),
            (Some(_), Some(_)) => Err(RuntimeError::AmbiguousBinding {
                model: model.to_string(),
            }),
            (None, _) => Err(RuntimeError::UnknownBinding {
                model: model.to_string(),
                attribute: attribute.unwrap_or("*").to_string(),
            }),
        }
    }

    pub fn subject(&self, model: &str, pk: &Value) -> Result<RecordSubject, RuntimeError> {
        Ok(self.storage.subject(model, pk)?)
    }

    /// Resolves every state of every machine.
    pub fn validate(&self) -> Result<Vec<MachineSummary>, CoreError> {
        self.machines
            .values()
            .map(|machine| {
                let states = machine.states()?;
                Ok(MachineSummary {
                    name: machine.name().to_string(),
                    initial_state: machine.initial_state_value()?,
                    states: states.iter().map(|s| s.value().to_string()).collect(),
                })
            })
            .collect()
    }

    /// Runs one sweep pass at the runtime clock's current time.
    pub fn sweep(&self) -> Result<SweepReport, CoreError> {
        self.sweeper.sweep(self.clock.now())
    }

    pub fn sync(&self) -> Result<(), RuntimeError> {
        Ok(self.storage.sync()?)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("storage", &self.storage)
            .field("machines", &self.machine_names())
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`Runtime`]. Anything not supplied comes from the
/// configuration.
pub struct RuntimeBuilder {
    config: Config,
    registry: Option<Arc<Registry>>,
    storage: Option<Storage>,
    schema: Option<SchemaDocument>,
    clock: Option<Arc<dyn Clock>>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: None,
            storage: None,
            schema: None,
            clock: None,
        }
    }

    /// Component registry; defaults to the built-ins.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Schema document, instead of reading `schema.path`.
    pub fn with_schema(mut self, schema: SchemaDocument) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        config.validate()?;

        let schema = match self.schema {
            Some(schema) => schema,
            None => {
                let path = config.schema.path.as_ref().ok_or_else(|| {
                    ConfigError::ValidationError("schema.path is not set".to_string())
                })?;
                SchemaDocument::from_file(path)?
            }
        };
        let source = SchemaSource::from(schema);

        let storage = match self.storage {
            Some(storage) => storage,
            None => Storage::open(
                StorageConfig::new(&config.storage.data_dir)
                    .with_fsync_policy(config.storage.fsync_policy),
            )?,
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(Registry::with_builtins()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let names: Vec<String> = match &source {
            SchemaSource::Document(doc) => doc.machine_names().into_iter().map(String::from).collect(),
            _ => Vec::new(),
        };

        let mut machines = BTreeMap::new();
        for name in names {
            let mut builder = StateMachine::builder(name.clone(), source.clone())
                .with_registry(Arc::clone(&registry))
                .with_commands_namespace(config.schema.commands_namespace.clone())
                .with_conditions_namespace(config.schema.conditions_namespace.clone())
                .with_infer_type_from_tag(config.schema.infer_type_from_tag)
                .with_timeout_store(Arc::new(storage.clone()))
                .with_clock(Arc::clone(&clock));
            if config.journal.enabled {
                builder = builder.with_journal(Arc::new(storage.clone()));
            }
            if config.storage.use_transactions {
                builder = builder.with_transactions(Arc::new(storage.clone()));
            }
            if !config.authorization.is_empty() {
                builder = builder.with_authorizer(Arc::new(RoleAuthorizer::new(
                    config.authorization.clone(),
                )));
            }
            machines.insert(name, Arc::new(builder.build()));
        }

        let mut sweeper = Sweeper::new(Arc::new(storage.clone()), Arc::new(storage.clone()));
        let mut bindings = BTreeMap::new();
        for bound in &config.bindings {
            let machine = machines
                .get(&bound.machine)
                .ok_or_else(|| CoreError::StateMachineNotFound {
                    machine: bound.machine.clone(),
                })?;
            let binding = Arc::new(
                Binding::new(Arc::clone(machine), bound.attribute.clone())
                    .with_virtual_attribute(bound.virtual_attribute()),
            );
            sweeper.bind(bound.model.clone(), Arc::clone(&binding));
            bindings.insert(
                (bound.model.clone(), bound.virtual_attribute().to_string()),
                binding,
            );
        }

        tracing::info!(
            machines = machines.len(),
            bindings = bindings.len(),
            journal = config.journal.enabled,
            transactions = config.storage.use_transactions,
            "Runtime ready"
        );

        Ok(Runtime {
            config,
            storage,
            registry,
            clock,
            machines,
            bindings,
            sweeper: Arc::new(sweeper),
        })
    }
}
