//! Subject records and their engine-facing handle.

use crate::store::Storage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statekeeper_core::{CoreError, Identity, Subject};
use std::collections::BTreeMap;

/// A persisted subject: its type, primary key and attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub model: String,
    pub pk: Value,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Role each identity holds on this record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<String, String>,
    /// Set by [`Storage::delete_record`]; the record stays readable.
    #[serde(default)]
    pub deleted: bool,
}

impl StoredRecord {
    pub fn new(model: impl Into<String>, pk: Value) -> Self {
        Self {
            model: model.into(),
            pk,
            attributes: BTreeMap::new(),
            roles: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_role(mut self, identity: impl Into<String>, role: impl Into<String>) -> Self {
        self.roles.insert(identity.into(), role.into());
        self
    }

    /// The serialized primary key records are indexed by.
    pub fn key(&self) -> String {
        self.pk.to_string()
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// A stored record as seen by the engine.
///
/// Attribute writes stay local until [`Subject::save`] names them, at which
/// point they go to storage (inside the open transaction, if any).
pub struct RecordSubject {
    storage: Storage,
    model: String,
    pk: Value,
    unsaved: BTreeMap<String, Value>,
    errors: Vec<(String, String)>,
}

impl RecordSubject {
    pub(crate) fn new(storage: Storage, model: impl Into<String>, pk: Value) -> Self {
        Self {
            storage,
            model: model.into(),
            pk,
            unsaved: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Validation errors recorded against `attribute`.
    pub fn errors_on(&self, attribute: &str) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|(attr, _)| attr == attribute)
            .map(|(_, message)| message.as_str())
            .collect()
    }

    pub fn errors(&self) -> &[(String, String)] {
        &self.errors
    }

    /// Attributes set but not yet saved.
    pub fn unsaved(&self) -> &BTreeMap<String, Value> {
        &self.unsaved
    }
}

impl Subject for RecordSubject {
    fn model_type(&self) -> &str {
        &self.model
    }

    fn primary_key(&self) -> Value {
        self.pk.clone()
    }

    fn get(&self, attribute: &str) -> Option<Value> {
        if let Some(value) = self.unsaved.get(attribute) {
            return Some(value.clone());
        }
        self.storage.read_attribute(&self.model, &self.pk, attribute)
    }

    fn set(&mut self, attribute: &str, value: Value) {
        self.unsaved.insert(attribute.to_string(), value);
    }

    fn save(&mut self, attributes: &[&str]) -> Result<(), CoreError> {
        let values: Vec<(String, Value)> = attributes
            .iter()
            .filter_map(|attr| {
                self.unsaved
                    .get(*attr)
                    .map(|value| (attr.to_string(), value.clone()))
            })
            .collect();
        if values.is_empty() {
            return Ok(());
        }

        self.storage
            .write_attributes(&self.model, &self.pk, &values)?;
        for (attr, _) in &values {
            self.unsaved.remove(attr);
        }
        Ok(())
    }

    fn is_deleted(&self) -> bool {
        self.storage
            .get_record(&self.model, &self.pk)
            .map_or(true, |record| record.deleted)
    }

    fn add_error(&mut self, attribute: &str, message: String) {
        self.errors.push((attribute.to_string(), message));
    }

    fn role_for(&self, identity: &Identity) -> Option<String> {
        self.storage
            .get_record(&self.model, &self.pk)
            .and_then(|record| record.roles.get(identity.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unsaved_writes_shadow_storage() {
        let storage = Storage::in_memory();
        storage
            .put_record(StoredRecord::new("ticket", json!({"id": 1})).with_attribute("status", json!("open")))
            .unwrap();

        let mut subject = storage.subject("ticket", &json!({"id": 1})).unwrap();
        subject.set("status", json!("closed"));
        assert_eq!(subject.get("status"), Some(json!("closed")));
        assert_eq!(
            storage.get_record("ticket", &json!({"id": 1})).unwrap().attribute("status"),
            Some(&json!("open"))
        );

        subject.save(&["status"]).unwrap();
        assert!(subject.unsaved().is_empty());
        assert_eq!(
            storage.get_record("ticket", &json!({"id": 1})).unwrap().attribute("status"),
            Some(&json!("closed"))
        );
    }

    #[test]
    fn test_roles_and_deletion() {
        let storage = Storage::in_memory();
        storage
            .put_record(StoredRecord::new("ticket", json!(7)).with_role("u-1", "agent"))
            .unwrap();

        let mut subject = storage.subject("ticket", &json!(7)).unwrap();
        assert_eq!(subject.role_for(&Identity::from("u-1")), Some("agent".to_string()));
        assert_eq!(subject.role_for(&Identity::from("u-2")), None);
        assert!(!subject.is_deleted());

        storage.delete_record("ticket", &json!(7)).unwrap();
        assert!(subject.is_deleted());

        subject.add_error("status", "rejected".to_string());
        assert_eq!(subject.errors_on("status"), vec!["rejected"]);
        assert!(subject.errors_on("other").is_empty());
    }

    #[test]
    fn test_record_serde_defaults() {
        let record: StoredRecord =
            serde_json::from_value(json!({"model": "ticket", "pk": {"id": 3}})).unwrap();
        assert!(record.attributes.is_empty());
        assert!(!record.deleted);
        assert_eq!(record.key(), "{\"id\":3}");
    }
}
