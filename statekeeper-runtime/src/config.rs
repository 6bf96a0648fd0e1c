//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STATEKEEPER_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use statekeeper_core::registry::{DEFAULT_COMMANDS_NAMESPACE, DEFAULT_CONDITIONS_NAMESPACE};
use statekeeper_journal::FsyncPolicy;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema document and component resolution.
    pub schema: SchemaConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Audit journal configuration.
    pub journal: JournalConfig,
    /// Timeout sweep configuration.
    pub sweep: SweepConfig,
    /// Machines attached to subject attributes.
    pub bindings: Vec<BindingConfig>,
    /// Permissions granted to subject roles.
    pub authorization: AuthorizationConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STATEKEEPER_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads a YAML file and applies environment variable overrides.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.schema.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.journal.apply_env_overrides();
        self.sweep.apply_env_overrides();
    }

    /// Checks settings that cannot be expressed by the types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sweep.interval_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for binding in &self.bindings {
            if binding.model.is_empty() || binding.machine.is_empty() || binding.attribute.is_empty()
            {
                return Err(ConfigError::ValidationError(
                    "bindings need model, machine and attribute".to_string(),
                ));
            }
            let key = (binding.model.as_str(), binding.virtual_attribute());
            if !seen.insert(key) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate binding for {}.{}",
                    binding.model,
                    binding.virtual_attribute()
                )));
            }
        }

        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Schema configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Schema document; `.json` is read as JSON, anything else as YAML.
    pub path: Option<PathBuf>,
    /// Namespace prefixed to unqualified command types.
    pub commands_namespace: String,
    /// Namespace prefixed to unqualified condition types.
    pub conditions_namespace: String,
    /// Use a component node's tag as its type when `type` is missing.
    pub infer_type_from_tag: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: None,
            commands_namespace: DEFAULT_COMMANDS_NAMESPACE.to_string(),
            conditions_namespace: DEFAULT_CONDITIONS_NAMESPACE.to_string(),
            infer_type_from_tag: false,
        }
    }
}

impl SchemaConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STATEKEEPER_SCHEMA") {
            self.path = Some(PathBuf::from(path));
        }

        if let Ok(infer) = std::env::var("STATEKEEPER_INFER_TYPE_FROM_TAG") {
            self.infer_type_from_tag = parse_flag(&infer);
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
    /// Fsync policy for journal appends.
    pub fsync_policy: FsyncPolicy,
    /// Run every transition inside a storage transaction.
    pub use_transactions: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_policy: FsyncPolicy::EveryWrite,
            use_transactions: true,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STATEKEEPER_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(policy) = std::env::var("STATEKEEPER_FSYNC_POLICY") {
            self.fsync_policy = FsyncPolicy::parse(&policy).unwrap_or(FsyncPolicy::EveryWrite);
        }

        if let Ok(tx) = std::env::var("STATEKEEPER_USE_TRANSACTIONS") {
            self.use_transactions = parse_flag(&tx);
        }
    }

    /// Returns the journal directory path.
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journal")
    }
}

/// Audit journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Record every transition in the journal.
    pub enabled: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl JournalConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("STATEKEEPER_JOURNAL_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
    }
}

/// Timeout sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Run the periodic sweep.
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl SweepConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("STATEKEEPER_SWEEP_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }

        if let Ok(interval) = std::env::var("STATEKEEPER_SWEEP_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.interval_secs = secs;
            }
        }
    }

    /// Returns the sweep interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn is_disabled(&self) -> bool {
        !self.enabled
    }
}

/// Attachment of a machine to one attribute of a subject type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub model: String,
    pub machine: String,
    /// Storage attribute holding the state value.
    pub attribute: String,
    /// Public name; defaults to `attribute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_attribute: Option<String>,
}

impl BindingConfig {
    pub fn new(
        model: impl Into<String>,
        machine: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            machine: machine.into(),
            attribute: attribute.into(),
            virtual_attribute: None,
        }
    }

    pub fn with_virtual_attribute(mut self, name: impl Into<String>) -> Self {
        self.virtual_attribute = Some(name.into());
        self
    }

    pub fn virtual_attribute(&self) -> &str {
        self.virtual_attribute.as_deref().unwrap_or(&self.attribute)
    }
}

/// Role based grants for the `Permission` condition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Permissions granted to each role.
    pub roles: BTreeMap<String, Vec<String>>,
}

impl AuthorizationConfig {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn grants(&self, role: &str, permission: &str) -> bool {
        self.roles
            .get(role)
            .map_or(false, |perms| perms.iter().any(|p| p == permission))
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
