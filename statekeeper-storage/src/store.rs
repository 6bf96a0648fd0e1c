//! Main storage implementation.

use crate::error::StorageError;
use crate::record::{RecordSubject, StoredRecord};
use crate::transaction::{Gate, StorageTransaction};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use statekeeper_core::{
    AuditEntry, AuditJournal, ClaimSet, CoreError, ScheduledTimeout, Subject, SubjectStore,
    TimeoutClaim, TimeoutKey, TimeoutStore, Transaction, TransactionManager,
};
use statekeeper_journal::{FsyncPolicy, Journal, JournalConfig};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const RECORDS_FILE: &str = "records.json";
const TIMEOUTS_FILE: &str = "timeouts.json";
const JOURNAL_DIR: &str = "journal";

type RecordKey = (String, String);

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory.
    pub dir: PathBuf,
    /// Journal configuration; its directory defaults to `<dir>/journal`.
    pub journal: JournalConfig,
}

impl StorageConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let journal = JournalConfig::new(dir.join(JOURNAL_DIR));
        Self { dir, journal }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.journal = self.journal.with_fsync_policy(policy);
        self
    }
}

/// State captured when a transaction begins.
struct Frame {
    records: HashMap<RecordKey, StoredRecord>,
    timeouts: Vec<ScheduledTimeout>,
    /// Journal entries appended inside the transaction, written on the
    /// outermost commit.
    staged: Vec<AuditEntry>,
}

struct Inner {
    dir: Option<PathBuf>,
    journal: Option<Journal>,
    records: RwLock<HashMap<RecordKey, StoredRecord>>,
    timeouts: RwLock<Vec<ScheduledTimeout>>,
    /// Every committed journal entry in append order.
    entries: RwLock<Vec<AuditEntry>>,
    claims: ClaimSet,
    gate: Gate,
    frames: Mutex<Vec<Frame>>,
}

/// Subject records, scheduled timeouts and the audit journal.
///
/// Cloning is cheap; clones share the same state. Every write goes through
/// one gate, and a transaction keeps the gate for its whole lifetime.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("dir", &self.inner.dir)
            .field("records", &self.inner.records.read().len())
            .field("timeouts", &self.inner.timeouts.read().len())
            .finish()
    }
}

impl Storage {
    /// Opens storage at the configured directory, recovering records,
    /// timeouts and the journal.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.dir)?;
        let journal = Journal::open(config.journal.clone())?;

        let stored: Vec<StoredRecord> =
            load_json(&config.dir.join(RECORDS_FILE))?.unwrap_or_default();
        let mut records = HashMap::with_capacity(stored.len());
        for record in stored {
            let key = (record.model.clone(), record.key());
            if records.insert(key, record).is_some() {
                return Err(StorageError::Corruption(format!(
                    "duplicate record in {}",
                    RECORDS_FILE
                )));
            }
        }

        let timeouts: Vec<ScheduledTimeout> =
            load_json(&config.dir.join(TIMEOUTS_FILE))?.unwrap_or_default();
        let entries: Vec<AuditEntry> = journal
            .read_all()?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();

        tracing::info!(
            "Recovery complete: {} records, {} timeouts, {} journal entries",
            records.len(),
            timeouts.len(),
            entries.len()
        );

        Ok(Self::from_parts(
            Some(config.dir),
            Some(journal),
            records,
            timeouts,
            entries,
        ))
    }

    /// Storage that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self::from_parts(None, None, HashMap::new(), Vec::new(), Vec::new())
    }

    fn from_parts(
        dir: Option<PathBuf>,
        journal: Option<Journal>,
        records: HashMap<RecordKey, StoredRecord>,
        timeouts: Vec<ScheduledTimeout>,
        entries: Vec<AuditEntry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir,
                journal,
                records: RwLock::new(records),
                timeouts: RwLock::new(timeouts),
                entries: RwLock::new(entries),
                claims: ClaimSet::new(),
                gate: Gate::default(),
                frames: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Data directory, or `None` for in-memory storage.
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.inner.journal.as_ref()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Stores a record, replacing any record with the same model and key.
    pub fn put_record(&self, record: StoredRecord) -> Result<(), StorageError> {
        let _gate = self.inner.gate.hold();
        let key = (record.model.clone(), record.key());
        self.inner.records.write().insert(key, record);
        self.persist_if_idle()
    }

    pub fn get_record(&self, model: &str, pk: &Value) -> Option<StoredRecord> {
        self.inner
            .records
            .read()
            .get(&(model.to_string(), pk.to_string()))
            .cloned()
    }

    /// Marks the record deleted. Its pending timeouts are dropped by the
    /// next sweep.
    pub fn delete_record(&self, model: &str, pk: &Value) -> Result<(), StorageError> {
        let _gate = self.inner.gate.hold();
        {
            let mut records = self.inner.records.write();
            let record = records
                .get_mut(&(model.to_string(), pk.to_string()))
                .ok_or_else(|| not_found(model, pk))?;
            record.deleted = true;
        }
        tracing::debug!(model, pk = %pk, "Record deleted");
        self.persist_if_idle()
    }

    /// Records of one model, ordered by key.
    pub fn records(&self, model: &str) -> Vec<StoredRecord> {
        let mut records: Vec<StoredRecord> = self
            .inner
            .records
            .read()
            .values()
            .filter(|r| r.model == model)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.key());
        records
    }

    /// An engine handle on a stored record.
    pub fn subject(&self, model: &str, pk: &Value) -> Result<RecordSubject, StorageError> {
        if !self
            .inner
            .records
            .read()
            .contains_key(&(model.to_string(), pk.to_string()))
        {
            return Err(not_found(model, pk));
        }
        Ok(RecordSubject::new(self.clone(), model, pk.clone()))
    }

    pub(crate) fn read_attribute(&self, model: &str, pk: &Value, attribute: &str) -> Option<Value> {
        self.inner
            .records
            .read()
            .get(&(model.to_string(), pk.to_string()))
            .and_then(|r| r.attributes.get(attribute).cloned())
    }

    pub(crate) fn write_attributes(
        &self,
        model: &str,
        pk: &Value,
        values: &[(String, Value)],
    ) -> Result<(), StorageError> {
        let _gate = self.inner.gate.hold();
        {
            let mut records = self.inner.records.write();
            let record = records
                .get_mut(&(model.to_string(), pk.to_string()))
                .ok_or_else(|| not_found(model, pk))?;
            for (attr, value) in values {
                record.attributes.insert(attr.clone(), value.clone());
            }
        }
        self.persist_if_idle()
    }

    // =========================================================================
    // Timeouts and journal
    // =========================================================================

    /// Every scheduled timeout, soonest first.
    pub fn timeouts(&self) -> Vec<ScheduledTimeout> {
        let mut all = self.inner.timeouts.read().clone();
        all.sort_by_key(|t| t.expires_at);
        all
    }

    /// Every committed journal entry in append order.
    pub fn journal_entries(&self) -> Vec<AuditEntry> {
        self.inner.entries.read().clone()
    }

    fn write_entry(&self, entry: AuditEntry) -> Result<(), StorageError> {
        if let Some(journal) = &self.inner.journal {
            journal.append(&entry)?;
        }
        self.inner.entries.write().push(entry);
        Ok(())
    }

    /// Flushes the journal and rewrites the data files.
    pub fn sync(&self) -> Result<(), StorageError> {
        let _gate = self.inner.gate.hold();
        if let Some(journal) = &self.inner.journal {
            journal.sync()?;
        }
        self.persist()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub(crate) fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    pub fn in_transaction(&self) -> bool {
        !self.inner.frames.lock().is_empty()
    }

    pub(crate) fn transaction_depth(&self) -> usize {
        self.inner.frames.lock().len()
    }

    pub(crate) fn push_frame(&self) {
        let frame = Frame {
            records: self.inner.records.read().clone(),
            timeouts: self.inner.timeouts.read().clone(),
            staged: Vec::new(),
        };
        self.inner.frames.lock().push(frame);
    }

    pub(crate) fn commit_frame(&self) -> Result<(), StorageError> {
        let frame = {
            let mut frames = self.inner.frames.lock();
            let frame = match frames.pop() {
                Some(frame) => frame,
                None => return Ok(()),
            };
            // Nested: the outermost transaction writes the entries.
            if let Some(parent) = frames.last_mut() {
                parent.staged.extend(frame.staged);
                return Ok(());
            }
            frame
        };

        let Frame {
            records,
            timeouts,
            staged,
        } = frame;
        let committed = self.inner.entries.read().len();

        // Data files before journal entries; any failure restores the snapshot.
        let written = self.persist().and_then(|()| {
            staged
                .into_iter()
                .try_for_each(|entry| self.write_entry(entry))
        });
        if let Err(e) = written {
            tracing::warn!(error = %e, "Commit failed, restoring snapshot");
            *self.inner.records.write() = records;
            *self.inner.timeouts.write() = timeouts;
            self.inner.entries.write().truncate(committed);
            if let Err(again) = self.persist() {
                tracing::error!(error = %again, "Failed to rewrite data files after a failed commit");
            }
            return Err(e);
        }

        tracing::debug!("Transaction committed");
        Ok(())
    }

    pub(crate) fn rollback_frame(&self) {
        let frame = match self.inner.frames.lock().pop() {
            Some(frame) => frame,
            None => return,
        };
        *self.inner.records.write() = frame.records;
        *self.inner.timeouts.write() = frame.timeouts;
        tracing::debug!(discarded = frame.staged.len(), "Transaction rolled back");
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn persist_if_idle(&self) -> Result<(), StorageError> {
        if self.in_transaction() {
            return Ok(());
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), StorageError> {
        let dir = match &self.inner.dir {
            Some(dir) => dir,
            None => return Ok(()),
        };

        let mut records: Vec<StoredRecord> =
            self.inner.records.read().values().cloned().collect();
        records.sort_by(|a, b| (&a.model, a.key()).cmp(&(&b.model, b.key())));
        write_json(&dir.join(RECORDS_FILE), &records)?;
        write_json(&dir.join(TIMEOUTS_FILE), &self.timeouts())?;
        Ok(())
    }
}

fn not_found(model: &str, pk: &Value) -> StorageError {
    StorageError::RecordNotFound {
        model: model.to_string(),
        pk: pk.to_string(),
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let value = serde_json::from_reader(reader).map_err(|e| {
        StorageError::Corruption(format!("{}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

/// Writes through a temporary file so a crash leaves the old file intact.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// =============================================================================
// Engine collaborators
// =============================================================================

impl SubjectStore for Storage {
    fn load(
        &self,
        model_type: &str,
        primary_key: &Value,
    ) -> Result<Option<Box<dyn Subject>>, CoreError> {
        match self.subject(model_type, primary_key) {
            Ok(subject) => Ok(Some(Box::new(subject))),
            Err(StorageError::RecordNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl TimeoutStore for Storage {
    fn insert(&self, record: ScheduledTimeout) -> Result<(), CoreError> {
        let _gate = self.inner.gate.hold();
        self.inner.timeouts.write().push(record);
        Ok(self.persist_if_idle()?)
    }

    fn delete_for(&self, key: &TimeoutKey) -> Result<usize, CoreError> {
        let _gate = self.inner.gate.hold();
        let removed = {
            let mut timeouts = self.inner.timeouts.write();
            let before = timeouts.len();
            timeouts.retain(|t| t.key() != *key);
            before - timeouts.len()
        };
        if removed > 0 {
            self.persist_if_idle()?;
        }
        Ok(removed)
    }

    fn delete(&self, id: Uuid) -> Result<bool, CoreError> {
        let _gate = self.inner.gate.hold();
        let removed = {
            let mut timeouts = self.inner.timeouts.write();
            let before = timeouts.len();
            timeouts.retain(|t| t.id != id);
            timeouts.len() != before
        };
        if removed {
            self.persist_if_idle()?;
        }
        Ok(removed)
    }

    fn for_key(&self, key: &TimeoutKey) -> Result<Vec<ScheduledTimeout>, CoreError> {
        Ok(self
            .inner
            .timeouts
            .read()
            .iter()
            .filter(|t| t.key() == *key)
            .cloned()
            .collect())
    }

    fn pending(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimeout>, CoreError> {
        Ok(self
            .timeouts()
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect())
    }

    fn claim(&self, record: &ScheduledTimeout) -> Result<Option<TimeoutClaim>, CoreError> {
        let claim = match self.inner.claims.try_acquire(record.key()) {
            Some(claim) => claim,
            None => return Ok(None),
        };
        let exists = self.inner.timeouts.read().iter().any(|t| t.id == record.id);
        Ok(exists.then_some(claim))
    }
}

impl AuditJournal for Storage {
    fn append(&self, entry: AuditEntry) -> Result<(), CoreError> {
        let _gate = self.inner.gate.hold();
        {
            let mut frames = self.inner.frames.lock();
            if let Some(frame) = frames.last_mut() {
                frame.staged.push(entry);
                return Ok(());
            }
        }
        Ok(self.write_entry(entry)?)
    }

    /// Committed entries, plus the ones staged by a transaction open on the
    /// calling thread.
    fn entries_for(
        &self,
        model: &str,
        model_pk: &str,
        attribute: Option<&str>,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        let mut entries: Vec<AuditEntry> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|e| e.concerns(model, model_pk, attribute))
            .cloned()
            .collect();

        if self.inner.gate.held_by_current() {
            let frames = self.inner.frames.lock();
            entries.extend(
                frames
                    .iter()
                    .flat_map(|f| f.staged.iter())
                    .filter(|e| e.concerns(model, model_pk, attribute))
                    .cloned(),
            );
        }
        Ok(entries)
    }
}

impl TransactionManager for Storage {
    fn begin(&self) -> Result<Box<dyn Transaction>, CoreError> {
        Ok(Box::new(StorageTransaction::begin(self.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use statekeeper_core::{Binding, Command, Context, Registry, SchemaDocument, StateMachine};
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> StorageConfig {
        StorageConfig::new(dir).with_fsync_policy(FsyncPolicy::EveryWrite)
    }

    fn key(pk: &str) -> TimeoutKey {
        TimeoutKey {
            model: "ticket".to_string(),
            model_pk: pk.to_string(),
            virtual_attribute: "status".to_string(),
            machine: "support".to_string(),
        }
    }

    fn entry(pk: &str, from: Option<&str>, to: &str) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            model: "ticket".to_string(),
            model_pk: pk.to_string(),
            machine: "support".to_string(),
            attribute: "status".to_string(),
            identity: None,
            event: None,
            from_state: from.map(str::to_string),
            to_state: to.to_string(),
            created_at: Utc::now(),
        }
    }

    const SUPPORT_SCHEMA: &str = r#"
state_machines:
  - name: support
    initial_state: open
    states:
      - value: open
        events:
          - label: resolve
            target: resolved
          - label: escalate
            target: escalated
        timeouts:
          - label: auto_close
            target: closed
            hours: 4
      - value: escalated
        events:
          - label: resolve
            target: resolved
        exit:
          - type: Refuse
      - value: resolved
        enter:
          - type: SetAttribute
            attribute: resolved_flag
            value: true
      - value: closed
"#;

    #[derive(Debug)]
    struct Refuse;

    impl Command for Refuse {
        fn name(&self) -> &str {
            "Refuse"
        }

        fn execute(&self, _ctx: &mut Context<'_>) -> Result<bool, CoreError> {
            Ok(false)
        }
    }

    fn support_binding(storage: &Storage) -> Binding {
        let registry = Registry::with_builtins();
        registry.register_command("statekeeper::commands::Refuse", |_| {
            Ok(Arc::new(Refuse) as Arc<dyn Command>)
        });
        let machine = StateMachine::builder(
            "support",
            SchemaDocument::from_yaml(SUPPORT_SCHEMA).unwrap(),
        )
        .with_registry(Arc::new(registry))
        .with_timeout_store(Arc::new(storage.clone()))
        .with_journal(Arc::new(storage.clone()))
        .with_transactions(Arc::new(storage.clone()))
        .build();
        Binding::new(Arc::new(machine), "status")
    }

    #[test]
    fn test_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(test_config(dir.path())).unwrap();
            storage
                .put_record(
                    StoredRecord::new("ticket", json!({"id": 1}))
                        .with_attribute("status", json!("open"))
                        .with_role("u-1", "agent"),
                )
                .unwrap();
            storage
                .insert(ScheduledTimeout::new(key("{\"id\":1}"), "auto_close", Utc::now()))
                .unwrap();
            storage.append(entry("{\"id\":1}", None, "open")).unwrap();
            storage.sync().unwrap();
        }

        let storage = Storage::open(test_config(dir.path())).unwrap();
        let record = storage.get_record("ticket", &json!({"id": 1})).unwrap();
        assert_eq!(record.attribute("status"), Some(&json!("open")));
        assert_eq!(record.roles.get("u-1"), Some(&"agent".to_string()));
        assert_eq!(storage.timeouts().len(), 1);
        assert_eq!(storage.journal_entries().len(), 1);
        assert_eq!(
            storage
                .last_entry_of("ticket", "{\"id\":1}", "status")
                .unwrap()
                .unwrap()
                .to_state,
            "open"
        );
    }

    #[test]
    fn test_records_by_model() {
        let storage = Storage::in_memory();
        for id in [3, 1, 2] {
            storage
                .put_record(StoredRecord::new("ticket", json!(id)))
                .unwrap();
        }
        storage
            .put_record(StoredRecord::new("invoice", json!(1)))
            .unwrap();

        let keys: Vec<String> = storage.records("ticket").iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
        assert!(storage.records("missing").is_empty());
    }

    #[test]
    fn test_delete_missing_record() {
        let storage = Storage::in_memory();
        let err = storage.delete_record("ticket", &json!(9)).unwrap_err();
        assert!(matches!(err, StorageError::RecordNotFound { .. }));
        assert!(storage.load("ticket", &json!(9)).unwrap().is_none());
    }

    #[test]
    fn test_rollback_restores_state() {
        let storage = Storage::in_memory();
        storage
            .put_record(StoredRecord::new("ticket", json!(1)).with_attribute("status", json!("open")))
            .unwrap();

        let tx = storage.begin().unwrap();
        storage
            .write_attributes("ticket", &json!(1), &[("status".to_string(), json!("closed"))])
            .unwrap();
        storage
            .insert(ScheduledTimeout::new(key("1"), "auto_close", Utc::now()))
            .unwrap();
        storage.append(entry("1", Some("open"), "closed")).unwrap();
        assert_eq!(storage.entries_for("ticket", "1", None).unwrap().len(), 1);
        assert!(storage.journal_entries().is_empty());
        tx.rollback().unwrap();

        assert!(!storage.in_transaction());
        assert_eq!(
            storage.read_attribute("ticket", &json!(1), "status"),
            Some(json!("open"))
        );
        assert!(storage.timeouts().is_empty());
        assert!(storage.entries_for("ticket", "1", None).unwrap().is_empty());
    }

    #[test]
    fn test_nested_commit_defers_to_outer() {
        let storage = Storage::in_memory();
        let outer = storage.begin().unwrap();
        let inner = storage.begin().unwrap();
        storage.append(entry("1", None, "open")).unwrap();
        inner.commit().unwrap();
        assert!(storage.in_transaction());
        assert!(storage.journal_entries().is_empty());

        outer.commit().unwrap();
        assert_eq!(storage.journal_entries().len(), 1);

        let outer = storage.begin().unwrap();
        let inner = storage.begin().unwrap();
        storage.append(entry("2", None, "open")).unwrap();
        inner.commit().unwrap();
        outer.rollback().unwrap();
        assert_eq!(storage.journal_entries().len(), 1);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let storage = Storage::in_memory();
        {
            let _tx = storage.begin().unwrap();
            storage
                .put_record(StoredRecord::new("ticket", json!(1)))
                .unwrap();
        }
        assert!(!storage.in_transaction());
        assert!(storage.get_record("ticket", &json!(1)).is_none());
    }

    #[test]
    fn test_commit_persists_files() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(test_config(dir.path())).unwrap();

        let tx = storage.begin().unwrap();
        storage
            .put_record(StoredRecord::new("ticket", json!(1)))
            .unwrap();
        storage.append(entry("1", None, "open")).unwrap();
        assert!(!dir.path().join(RECORDS_FILE).exists());
        tx.commit().unwrap();

        assert!(dir.path().join(RECORDS_FILE).exists());
        assert!(dir.path().join(TIMEOUTS_FILE).exists());
        drop(storage);

        let reopened = Storage::open(test_config(dir.path())).unwrap();
        assert!(reopened.get_record("ticket", &json!(1)).is_some());
        assert_eq!(reopened.journal_entries().len(), 1);
    }

    #[test]
    fn test_corrupt_records_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(RECORDS_FILE), b"{not json").unwrap();
        let err = Storage::open(test_config(dir.path())).unwrap_err();
        assert_eq!(err.error_code(), "CORRUPTION");
    }

    #[test]
    fn test_claim_requires_existing_record() {
        let storage = Storage::in_memory();
        let record = ScheduledTimeout::new(key("1"), "auto_close", Utc::now());
        assert!(storage.claim(&record).unwrap().is_none());

        storage.insert(record.clone()).unwrap();
        let claim = storage.claim(&record).unwrap().unwrap();
        assert!(storage.claim(&record).unwrap().is_none());
        drop(claim);
        assert!(storage.claim(&record).unwrap().is_some());
    }

    #[test]
    fn test_engine_transition_commits() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(test_config(dir.path())).unwrap();
        let binding = support_binding(&storage);
        storage
            .put_record(StoredRecord::new("ticket", json!({"id": 1})))
            .unwrap();

        let mut subject = storage.subject("ticket", &json!({"id": 1})).unwrap();
        let ctx = binding.init(&mut subject, None).unwrap();
        assert!(!ctx.has_errors() && !ctx.has_exception());
        drop(ctx);
        assert_eq!(storage.timeouts().len(), 1);

        let ctx = binding.trigger(&mut subject, "resolve", None).unwrap();
        assert!(!ctx.has_errors() && !ctx.has_exception());
        drop(ctx);

        let record = storage.get_record("ticket", &json!({"id": 1})).unwrap();
        assert_eq!(record.attribute("status"), Some(&json!("resolved")));
        assert_eq!(record.attribute("resolved_flag"), Some(&json!(true)));
        assert!(storage.timeouts().is_empty());

        let history: Vec<(Option<String>, String)> = storage
            .journal_entries()
            .into_iter()
            .map(|e| (e.from_state, e.to_state))
            .collect();
        assert_eq!(
            history,
            vec![
                (None, "open".to_string()),
                (Some("open".to_string()), "resolved".to_string()),
            ]
        );

        drop(subject);
        drop(binding);
        drop(storage);
        let reopened = Storage::open(test_config(dir.path())).unwrap();
        assert_eq!(
            reopened
                .get_record("ticket", &json!({"id": 1}))
                .unwrap()
                .attribute("status"),
            Some(&json!("resolved"))
        );
        assert_eq!(reopened.journal_entries().len(), 2);
    }

    #[test]
    fn test_engine_veto_rolls_back() {
        let storage = Storage::in_memory();
        let binding = support_binding(&storage);
        storage
            .put_record(StoredRecord::new("ticket", json!(1)).with_attribute("status", json!("escalated")))
            .unwrap();

        let mut subject = storage.subject("ticket", &json!(1)).unwrap();
        let ctx = binding.trigger(&mut subject, "resolve", None).unwrap();
        assert!(ctx.has_errors());
        drop(ctx);

        assert!(!storage.in_transaction());
        assert_eq!(subject.get("status"), Some(json!("escalated")));
        assert!(!subject.errors_on("status").is_empty());
        assert!(storage.journal_entries().is_empty());
    }

    #[test]
    fn test_failed_commit_restores_storage() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(test_config(dir.path())).unwrap();
        let binding = support_binding(&storage);
        storage
            .put_record(StoredRecord::new("ticket", json!(1)))
            .unwrap();

        let mut subject = storage.subject("ticket", &json!(1)).unwrap();
        let ctx = binding.init(&mut subject, None).unwrap();
        assert!(!ctx.has_exception());
        drop(ctx);
        let timeouts = storage.timeouts();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(storage.journal_entries().len(), 1);

        // A directory in place of the records file makes the rewrite fail.
        let records_file = dir.path().join(RECORDS_FILE);
        fs::remove_file(&records_file).unwrap();
        fs::create_dir(&records_file).unwrap();

        let ctx = binding.trigger(&mut subject, "resolve", None).unwrap();
        assert!(ctx.has_exception());
        drop(ctx);

        assert!(!storage.in_transaction());
        assert_eq!(subject.get("status"), Some(json!("open")));
        assert_eq!(
            storage.read_attribute("ticket", &json!(1), "status"),
            Some(json!("open"))
        );
        assert_eq!(storage.read_attribute("ticket", &json!(1), "resolved_flag"), None);
        assert_eq!(storage.timeouts(), timeouts);
        assert_eq!(storage.journal_entries().len(), 1);

        fs::remove_dir(&records_file).unwrap();
        storage.sync().unwrap();
        drop(subject);
        drop(binding);
        drop(storage);

        let reopened = Storage::open(test_config(dir.path())).unwrap();
        assert_eq!(
            reopened
                .get_record("ticket", &json!(1))
                .unwrap()
                .attribute("status"),
            Some(&json!("open"))
        );
        assert_eq!(reopened.journal_entries().len(), 1);
        assert_eq!(reopened.timeouts().len(), 1);
    }

    #[test]
    fn test_sweep_through_storage() {
        use statekeeper_core::Sweeper;

        let storage = Storage::in_memory();
        let binding = Arc::new(support_binding(&storage));
        for id in 1..=3 {
            storage
                .put_record(StoredRecord::new("ticket", json!(id)))
                .unwrap();
            let mut subject = storage.subject("ticket", &json!(id)).unwrap();
            binding.init(&mut subject, None).unwrap();
        }
        storage.delete_record("ticket", &json!(3)).unwrap();

        let sweeper = Sweeper::new(Arc::new(storage.clone()), Arc::new(storage.clone()))
            .with_binding("ticket", Arc::clone(&binding));
        let report = sweeper.sweep(Utc::now() + Duration::hours(5)).unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.triggered, 2);
        assert_eq!(report.dropped, 1);
        assert!(storage.timeouts().is_empty());
        for id in 1..=2 {
            assert_eq!(
                storage.read_attribute("ticket", &json!(id), "status"),
                Some(json!("closed"))
            );
        }
    }
}
