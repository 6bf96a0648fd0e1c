//! # statekeeper-runtime
//!
//! Runtime wiring for statekeeper.
//!
//! This crate provides:
//! - Configuration loading (YAML file plus environment overrides)
//! - Assembly of storage, machines and bindings from configuration
//! - Role based authorization for the `Permission` condition
//! - The periodic timeout sweep scheduler

pub mod authorizer;
pub mod config;
pub mod error;
pub mod runtime;
pub mod scheduler;

pub use authorizer::RoleAuthorizer;
pub use config::{
    AuthorizationConfig, BindingConfig, Config, ConfigError, JournalConfig, SchemaConfig,
    StorageConfig, SweepConfig,
};
pub use error::RuntimeError;
pub use runtime::{MachineSummary, Runtime, RuntimeBuilder};
pub use scheduler::{SweepScheduler, SweepStats};
