//! # statekeeper-storage
//!
//! Storage layer for statekeeper.
//!
//! This crate provides:
//! - Subject records loadable as engine subjects
//! - Scheduled timeout persistence with per-key claims
//! - The audit journal backed by `statekeeper-journal`
//! - Transactions with snapshot rollback

pub mod error;
pub mod record;
pub mod store;
mod transaction;

pub use error::StorageError;
pub use record::{RecordSubject, StoredRecord};
pub use store::{Storage, StorageConfig};
