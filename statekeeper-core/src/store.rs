//! Persistence collaborators: scheduled timeouts, the audit journal and
//! transactions.
//!
//! The in-memory implementations here back tests and embedded use; the
//! `statekeeper-storage` crate provides durable ones.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub use statekeeper_journal::AuditEntry;

/// Identifies every timeout scheduled for one subject attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutKey {
    pub model: String,
    pub model_pk: String,
    pub virtual_attribute: String,
    pub machine: String,
}

/// A persisted timeout waiting to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTimeout {
    pub id: Uuid,
    pub model: String,
    pub model_pk: String,
    pub virtual_attribute: String,
    pub machine: String,
    /// Label of the event to trigger.
    pub event: String,
    pub expires_at: DateTime<Utc>,
}

impl ScheduledTimeout {
    pub fn new(key: TimeoutKey, event: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: key.model,
            model_pk: key.model_pk,
            virtual_attribute: key.virtual_attribute,
            machine: key.machine,
            event: event.into(),
            expires_at,
        }
    }

    pub fn key(&self) -> TimeoutKey {
        TimeoutKey {
            model: self.model.clone(),
            model_pk: self.model_pk.clone(),
            virtual_attribute: self.virtual_attribute.clone(),
            machine: self.machine.clone(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage for scheduled timeouts.
pub trait TimeoutStore: Send + Sync {
    fn insert(&self, record: ScheduledTimeout) -> Result<(), CoreError>;

    /// Deletes every record for the key. Returns how many were removed.
    fn delete_for(&self, key: &TimeoutKey) -> Result<usize, CoreError>;

    /// Deletes one record. Returns false if it was already gone.
    fn delete(&self, id: Uuid) -> Result<bool, CoreError>;

    fn for_key(&self, key: &TimeoutKey) -> Result<Vec<ScheduledTimeout>, CoreError>;

    /// Records with `expires_at <= now`, oldest first.
    fn pending(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimeout>, CoreError>;

    /// Claims the record's key exclusively.
    ///
    /// Returns `None` if another worker holds the key or the record no longer
    /// exists. The claim is released when the guard drops.
    fn claim(&self, record: &ScheduledTimeout) -> Result<Option<TimeoutClaim>, CoreError>;
}

/// Set of keys currently claimed by sweep workers.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    held: Arc<Mutex<HashSet<TimeoutKey>>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: TimeoutKey) -> Option<TimeoutClaim> {
        let mut held = self.held.lock();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(TimeoutClaim {
            key,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, key: &TimeoutKey) -> bool {
        self.held.lock().contains(key)
    }
}

/// Exclusive hold on a timeout key.
#[derive(Debug)]
pub struct TimeoutClaim {
    key: TimeoutKey,
    held: Arc<Mutex<HashSet<TimeoutKey>>>,
}

impl TimeoutClaim {
    pub fn key(&self) -> &TimeoutKey {
        &self.key
    }
}

impl Drop for TimeoutClaim {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

/// Append-only audit trail of state changes.
pub trait AuditJournal: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<(), CoreError>;

    /// Entries of a subject in append order, optionally narrowed to one
    /// attribute.
    fn entries_for(
        &self,
        model: &str,
        model_pk: &str,
        attribute: Option<&str>,
    ) -> Result<Vec<AuditEntry>, CoreError>;

    fn last_entry_of(
        &self,
        model: &str,
        model_pk: &str,
        attribute: &str,
    ) -> Result<Option<AuditEntry>, CoreError> {
        Ok(self.entries_for(model, model_pk, Some(attribute))?.pop())
    }
}

/// Starts transactions spanning attribute saves, timeout writes and journal
/// appends.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>, CoreError>;
}

pub trait Transaction {
    fn commit(self: Box<Self>) -> Result<(), CoreError>;

    fn rollback(self: Box<Self>) -> Result<(), CoreError>;
}

/// Timeout store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryTimeoutStore {
    records: RwLock<Vec<ScheduledTimeout>>,
    claims: ClaimSet,
}

impl MemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn all(&self) -> Vec<ScheduledTimeout> {
        self.records.read().clone()
    }
}

impl TimeoutStore for MemoryTimeoutStore {
    fn insert(&self, record: ScheduledTimeout) -> Result<(), CoreError> {
        self.records.write().push(record);
        Ok(())
    }

    fn delete_for(&self, key: &TimeoutKey) -> Result<usize, CoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.key() != *key);
        Ok(before - records.len())
    }

    fn delete(&self, id: Uuid) -> Result<bool, CoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn for_key(&self, key: &TimeoutKey) -> Result<Vec<ScheduledTimeout>, CoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.key() == *key)
            .cloned()
            .collect())
    }

    fn pending(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimeout>, CoreError> {
        let mut due: Vec<ScheduledTimeout> = self
            .records
            .read()
            .iter()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.expires_at);
        Ok(due)
    }

    fn claim(&self, record: &ScheduledTimeout) -> Result<Option<TimeoutClaim>, CoreError> {
        let claim = match self.claims.try_acquire(record.key()) {
            Some(claim) => claim,
            None => return Ok(None),
        };
        let exists = self.records.read().iter().any(|r| r.id == record.id);
        Ok(exists.then_some(claim))
    }
}

/// Audit journal kept in memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }
}

impl AuditJournal for MemoryJournal {
    fn append(&self, entry: AuditEntry) -> Result<(), CoreError> {
        self.entries.write().push(entry);
        Ok(())
    }

    fn entries_for(
        &self,
        model: &str,
        model_pk: &str,
        attribute: Option<&str>,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.concerns(model, model_pk, attribute))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(pk: &str) -> TimeoutKey {
        TimeoutKey {
            model: "article".to_string(),
            model_pk: pk.to_string(),
            virtual_attribute: "status".to_string(),
            machine: "publishing".to_string(),
        }
    }

    #[test]
    fn test_pending_and_delete_for() {
        let store = MemoryTimeoutStore::new();
        let now = Utc::now();
        store
            .insert(ScheduledTimeout::new(key("1"), "expire", now + Duration::hours(1)))
            .unwrap();
        store
            .insert(ScheduledTimeout::new(key("1"), "remind", now - Duration::minutes(1)))
            .unwrap();
        store
            .insert(ScheduledTimeout::new(key("2"), "expire", now - Duration::hours(1)))
            .unwrap();

        let due = store.pending(now).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].model_pk, "2");

        assert_eq!(store.delete_for(&key("1")).unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_claim_is_exclusive_per_key() {
        let store = MemoryTimeoutStore::new();
        let record = ScheduledTimeout::new(key("1"), "expire", Utc::now());
        store.insert(record.clone()).unwrap();

        let claim = store.claim(&record).unwrap().expect("first claim");
        assert!(store.claim(&record).unwrap().is_none());
        drop(claim);
        assert!(store.claim(&record).unwrap().is_some());
    }

    #[test]
    fn test_claim_of_deleted_record() {
        let store = MemoryTimeoutStore::new();
        let record = ScheduledTimeout::new(key("1"), "expire", Utc::now());
        store.insert(record.clone()).unwrap();
        assert!(store.delete(record.id).unwrap());
        assert!(!store.delete(record.id).unwrap());

        assert!(store.claim(&record).unwrap().is_none());
        assert!(!store.claims.is_held(&record.key()));
    }

    fn entry(from: Option<&str>, to: &str) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            model: "article".to_string(),
            model_pk: r#"{"id":7}"#.to_string(),
            machine: "publishing".to_string(),
            attribute: "status".to_string(),
            identity: None,
            event: None,
            from_state: from.map(str::to_string),
            to_state: to.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_journal_last_entry() {
        let journal = MemoryJournal::new();
        journal.append(entry(None, "draft")).unwrap();
        journal.append(entry(Some("draft"), "review")).unwrap();

        let pk = r#"{"id":7}"#;
        let last = journal.last_entry_of("article", pk, "status").unwrap().unwrap();
        assert_eq!(last.to_state, "review");
        assert!(journal.last_entry_of("article", pk, "other").unwrap().is_none());
    }
}
