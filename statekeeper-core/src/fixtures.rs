//! Shared test fixtures.

use crate::command::Command;
use crate::context::Context;
use crate::error::CoreError;
use crate::machine::{StateMachine, StateMachineBuilder};
use crate::registry::Registry;
use crate::schema::SchemaDocument;
use crate::store::{Transaction, TransactionManager};
use crate::subject::{Identity, Subject, SubjectStore};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub(crate) const SAMPLE_SCHEMA: &str = r#"
state_machines:
  - name: publishing
    initial_state: draft
    states:
      - value: draft
        label: Draft
        color: grey
        events:
          - label: submit
            target: review
            roles: [editor]
            conditions:
              - type: AttributeCheck
                getter: active
                expectedValue: true
          - label: fast_track
            target: review
            roles: [admin]
        enter:
          - type: SetAttribute
            attribute: color_seen
            value: grey
      - value: review
        label: In review
        events:
          - label: approve
            target: published
            roles: [admin]
          - label: reject
            target: draft
            roles: [admin]
          - label: comment
            target: review
            roles: [admin, editor]
        timeouts:
          - label: expire
            target: draft
            days: 1
        enter:
          - type: SetAttribute
            attribute: reviewed
            value: true
        exit:
          - type: Checkpoint
      - value: published
        label: Published
"#;

/// Clears `reviewed` and accepts the transition.
#[derive(Debug)]
pub(crate) struct Checkpoint;

impl Command for Checkpoint {
    fn name(&self) -> &str {
        "Checkpoint"
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        ctx.subject_mut().set("reviewed", json!(false));
        Ok(true)
    }
}

/// Rejects every transition.
#[derive(Debug)]
pub(crate) struct Veto;

impl Command for Veto {
    fn name(&self) -> &str {
        "Veto"
    }

    fn execute(&self, _ctx: &mut Context<'_>) -> Result<bool, CoreError> {
        Ok(false)
    }
}

impl Veto {
    /// A fixture registry whose `exit` (Checkpoint) or `enter`
    /// (SetAttribute) commands veto.
    pub(crate) fn registry(phase: &str) -> Arc<Registry> {
        let registry = fixture_registry();
        let name = match phase {
            "exit" => "statekeeper::commands::Checkpoint",
            _ => "statekeeper::commands::SetAttribute",
        };
        registry.register_command(name, |_| Ok(Arc::new(Veto) as Arc<dyn Command>));
        registry
    }
}

pub(crate) fn fixture_registry() -> Arc<Registry> {
    let registry = Registry::with_builtins();
    registry.register_command("statekeeper::commands::Checkpoint", |_| {
        Ok(Arc::new(Checkpoint) as Arc<dyn Command>)
    });
    Arc::new(registry)
}

/// The sample `publishing` machine, further configured by `configure`.
pub(crate) fn sample_machine_with<F>(configure: F) -> StateMachine
where
    F: FnOnce(StateMachineBuilder) -> StateMachineBuilder,
{
    let doc = SchemaDocument::from_yaml(SAMPLE_SCHEMA).unwrap();
    configure(StateMachine::builder("publishing", doc).with_registry(fixture_registry())).build()
}

/// An in-memory subject of type `document`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Document {
    key: Value,
    attrs: BTreeMap<String, Value>,
    roles: HashMap<String, String>,
    errors: Vec<(String, String)>,
    saves: Vec<String>,
    deleted: bool,
    fail_saves: bool,
}

impl Document {
    pub(crate) fn new(id: i64) -> Self {
        Self::with_key(json!({ "id": id }))
    }

    pub(crate) fn with_key(key: Value) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    pub(crate) fn with(mut self, attr: &str, value: Value) -> Self {
        self.attrs.insert(attr.to_string(), value);
        self
    }

    pub(crate) fn with_role(mut self, identity: &str, role: &str) -> Self {
        self.roles.insert(identity.to_string(), role.to_string());
        self
    }

    pub(crate) fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub(crate) fn failing_saves(mut self) -> Self {
        self.fail_saves = true;
        self
    }

    pub(crate) fn attr(&self, name: &str) -> Value {
        self.attrs.get(name).cloned().unwrap_or(Value::Null)
    }

    pub(crate) fn saves(&self) -> Vec<String> {
        self.saves.clone()
    }

    pub(crate) fn errors_on(&self, attr: &str) -> Vec<String> {
        self.errors
            .iter()
            .filter(|(a, _)| a == attr)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Subject for Document {
    fn model_type(&self) -> &str {
        "document"
    }

    fn primary_key(&self) -> Value {
        self.key.clone()
    }

    fn get(&self, attribute: &str) -> Option<Value> {
        self.attrs.get(attribute).cloned()
    }

    fn set(&mut self, attribute: &str, value: Value) {
        self.attrs.insert(attribute.to_string(), value);
    }

    fn save(&mut self, attributes: &[&str]) -> Result<(), CoreError> {
        if self.fail_saves {
            return Err(CoreError::store("save rejected"));
        }
        self.saves.extend(attributes.iter().map(|a| a.to_string()));
        Ok(())
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn add_error(&mut self, attribute: &str, message: String) {
        self.errors.push((attribute.to_string(), message));
    }

    fn role_for(&self, identity: &Identity) -> Option<String> {
        self.roles.get(identity.as_str()).cloned()
    }
}

type Documents = Arc<Mutex<HashMap<String, Document>>>;

/// Shared documents, loadable as subjects from several threads.
#[derive(Clone, Default)]
pub(crate) struct DocumentStore {
    docs: Documents,
}

impl DocumentStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, doc: Document) {
        self.docs.lock().insert(doc.key.to_string(), doc);
    }

    pub(crate) fn get(&self, id: i64) -> Document {
        self.docs.lock()[&json!({ "id": id }).to_string()].clone()
    }

    pub(crate) fn remove(&self, id: i64) {
        self.docs.lock().remove(&json!({ "id": id }).to_string());
    }

    pub(crate) fn mark_deleted(&self, id: i64) {
        if let Some(doc) = self.docs.lock().get_mut(&json!({ "id": id }).to_string()) {
            doc.deleted = true;
        }
    }

    pub(crate) fn handle(&self, id: i64) -> StoredDocument {
        StoredDocument {
            docs: Arc::clone(&self.docs),
            key: json!({ "id": id }),
        }
    }
}

impl SubjectStore for DocumentStore {
    fn load(
        &self,
        model_type: &str,
        primary_key: &Value,
    ) -> Result<Option<Box<dyn Subject>>, CoreError> {
        if model_type != "document" || !self.docs.lock().contains_key(&primary_key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(StoredDocument {
            docs: Arc::clone(&self.docs),
            key: primary_key.clone(),
        })))
    }
}

/// Live view of a document inside a [`DocumentStore`].
pub(crate) struct StoredDocument {
    docs: Documents,
    key: Value,
}

impl StoredDocument {
    fn with_doc<R>(&self, f: impl FnOnce(&mut Document) -> R) -> Option<R> {
        self.docs.lock().get_mut(&self.key.to_string()).map(f)
    }
}

impl Subject for StoredDocument {
    fn model_type(&self) -> &str {
        "document"
    }

    fn primary_key(&self) -> Value {
        self.key.clone()
    }

    fn get(&self, attribute: &str) -> Option<Value> {
        self.with_doc(|d| d.get(attribute)).flatten()
    }

    fn set(&mut self, attribute: &str, value: Value) {
        self.with_doc(|d| d.set(attribute, value));
    }

    fn save(&mut self, attributes: &[&str]) -> Result<(), CoreError> {
        self.with_doc(|d| d.save(attributes)).unwrap_or(Ok(()))
    }

    fn is_deleted(&self) -> bool {
        self.with_doc(|d| d.deleted).unwrap_or(true)
    }

    fn add_error(&mut self, attribute: &str, message: String) {
        self.with_doc(|d| d.add_error(attribute, message));
    }

    fn role_for(&self, identity: &Identity) -> Option<String> {
        self.with_doc(|d| d.role_for(identity)).flatten()
    }
}

/// Records the transaction calls it receives.
#[derive(Default)]
pub(crate) struct RecordingTransactions {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingTransactions {
    pub(crate) fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }
}

impl TransactionManager for RecordingTransactions {
    fn begin(&self) -> Result<Box<dyn Transaction>, CoreError> {
        self.log.lock().push("begin");
        Ok(Box::new(RecordingTransaction {
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingTransaction {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Transaction for RecordingTransaction {
    fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.log.lock().push("commit");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        self.log.lock().push("rollback");
        Ok(())
    }
}
