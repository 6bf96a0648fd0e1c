//! # statekeeper-core
//!
//! Schema-driven state machine engine for statekeeper.
//!
//! This crate provides:
//! - Schema documents (JSON/YAML) and lazy, memoized state resolution
//! - Events, timeouts, conditions and commands
//! - The transition engine with optional transactions
//! - Trigger dispatch through attribute bindings
//! - Sweeping of due timeouts
//! - Graphviz export

pub mod binding;
pub mod clock;
pub mod command;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod machine;
pub mod registry;
pub mod schema;
pub mod state;
pub mod store;
pub mod subject;
pub mod sweep;
pub mod timeout;

#[cfg(test)]
pub(crate) mod fixtures;

pub use binding::{Binding, EventRef};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, LogLevel, LogMessage, SetAttribute};
pub use condition::{AttributeCheck, Authorizer, Condition, Permission};
pub use context::Context;
pub use error::CoreError;
pub use event::{Event, TimeoutSpec};
pub use graph::{render_dot, Profile};
pub use machine::{StateMachine, StateMachineBuilder};
pub use registry::{ComponentSpec, Registry, Resolver};
pub use schema::{ComponentNode, MachineSchema, SchemaDocument, SchemaSource};
pub use state::{Eligibility, State};
pub use store::{
    AuditEntry, AuditJournal, ClaimSet, MemoryJournal, MemoryTimeoutStore, ScheduledTimeout,
    TimeoutClaim, TimeoutKey, TimeoutStore, Transaction, TransactionManager,
};
pub use subject::{Identity, Subject, SubjectStore};
pub use sweep::{FireOutcome, SweepReport, Sweeper};
