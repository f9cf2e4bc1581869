//! The per-record attribute store.
//!
//! Holds the two attribute maps — `active` (editable, observed) and
//! `reference` (last-synced snapshot) — with deep-copy semantics between
//! them: the two never share a mutable sub-object, so mutating one never
//! observably mutates the other. Deep comparison of the two maps is the
//! sole authority for dirty tracking.

use crate::error::{BindError, BindResult};
use crate::value::{get_path, root_key, set_path};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};

/// Attribute names that collide with internal fields and can never be
/// used as attributes. Rejected with a hard error, never renamed.
pub const RESERVED_NAMES: &[&str] = &[
    "uid",
    "active",
    "reference",
    "errors",
    "loading",
    "saving",
    "deleting",
    "fatal",
    "memberships",
];

/// An observed attribute change produced by a set.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    /// The path that was set.
    pub attribute: String,
    /// The value before the set.
    pub previous: Value,
    /// The value after the set.
    pub value: Value,
}

/// Dual-state attribute storage for one record.
#[derive(Debug, Clone)]
pub(crate) struct AttributeStore {
    defaults: IndexMap<String, Value>,
    active: Map<String, Value>,
    reference: Map<String, Value>,
    registered: IndexSet<String>,
}

impl AttributeStore {
    /// Creates a store with both states at the declared defaults.
    pub fn new(defaults: IndexMap<String, Value>) -> Self {
        let initial: Map<String, Value> = defaults
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let registered = defaults.keys().cloned().collect();
        Self {
            defaults,
            active: initial.clone(),
            reference: initial,
            registered,
        }
    }

    /// Reads an active value by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.active, path)
    }

    /// Reads an active value by dotted path, with a fallback.
    pub fn get_or(&self, path: &str, fallback: Value) -> Value {
        self.get(path).cloned().unwrap_or(fallback)
    }

    /// Reads a reference (saved) value by dotted path.
    pub fn saved(&self, path: &str) -> Option<&Value> {
        get_path(&self.reference, path)
    }

    /// Reads a reference value by dotted path, with a fallback.
    pub fn saved_or(&self, path: &str, fallback: Value) -> Value {
        self.saved(path).cloned().unwrap_or(fallback)
    }

    /// Writes an active value by dotted path.
    ///
    /// First-time assignment of an unregistered name registers it (once;
    /// re-registration is a no-op) and rejects reserved names. Returns
    /// the change when an already-defined value actually changed —
    /// first-time definition is not a change.
    pub fn set(&mut self, path: &str, value: Value) -> BindResult<Option<Change>> {
        let root = root_key(path);
        if !self.registered.contains(root) {
            if RESERVED_NAMES.contains(&root) {
                return Err(BindError::ReservedAttribute {
                    name: root.to_string(),
                });
            }
            self.registered.insert(root.to_string());
        }

        let previous = set_path(&mut self.active, path, value.clone());
        Ok(match previous {
            Some(previous) if previous != value => Some(Change {
                attribute: path.to_string(),
                previous,
                value,
            }),
            _ => None,
        })
    }

    /// Restores an attribute to its declared default. Declared attributes
    /// always remain present; an undeclared runtime attribute is removed.
    pub fn unset(&mut self, path: &str) -> Option<Change> {
        let root = root_key(path).to_string();
        match self.defaults.get(&root).cloned() {
            Some(default) => self
                .set(&root, default)
                .expect("registered attribute cannot be reserved"),
            None => self.active.remove(&root).map(|previous| Change {
                attribute: root,
                previous,
                value: Value::Null,
            }),
        }
    }

    /// Deep-copies the whole active map into reference.
    pub fn sync_all(&mut self) {
        self.reference = self.active.clone();
    }

    /// Deep-copies the named active attributes into reference.
    pub fn sync_attributes(&mut self, names: &[String]) {
        for name in names {
            match self.active.get(name) {
                Some(value) => {
                    self.reference.insert(name.clone(), value.clone());
                }
                None => {
                    self.reference.remove(name);
                }
            }
        }
    }

    /// Deep-copies the whole reference map back into active.
    pub fn reset_all(&mut self) {
        self.active = self.reference.clone();
    }

    /// Deep-copies the named reference attributes back into active.
    pub fn reset_attributes(&mut self, names: &[String]) {
        for name in names {
            match self.reference.get(name) {
                Some(value) => {
                    self.active.insert(name.clone(), value.clone());
                }
                None => {
                    self.active.remove(name);
                }
            }
        }
    }

    /// Restores both states to the declared defaults.
    pub fn clear(&mut self) {
        let initial: Map<String, Value> = self
            .defaults
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        self.active = initial.clone();
        self.reference = initial;
    }

    /// Returns the active attribute map.
    pub fn active(&self) -> &Map<String, Value> {
        &self.active
    }

    /// Mutable access to the active map, for mutation passes.
    pub fn active_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.active
    }

    /// Returns the reference attribute map.
    pub fn reference(&self) -> &Map<String, Value> {
        &self.reference
    }

    /// Returns the declared defaults.
    pub fn defaults(&self) -> &IndexMap<String, Value> {
        &self.defaults
    }

    /// Returns true when the attribute is currently defined.
    pub fn has(&self, name: &str) -> bool {
        self.active.contains_key(root_key(name))
    }

    /// Returns the currently-defined attribute names.
    pub fn attribute_names(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Names of attributes whose active value deep-differs from reference.
    pub fn changed(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.active.keys() {
            if self.reference.get(name) != self.active.get(name) {
                names.push(name.clone());
            }
        }
        for name in self.reference.keys() {
            if !self.active.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Returns true when the named attribute is dirty.
    pub fn is_changed(&self, name: &str) -> bool {
        self.active.get(name) != self.reference.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> AttributeStore {
        let mut defaults = IndexMap::new();
        defaults.insert("id".to_string(), Value::Null);
        defaults.insert("name".to_string(), json!(""));
        defaults.insert("meta".to_string(), json!({"color": "red"}));
        AttributeStore::new(defaults)
    }

    #[test]
    fn starts_clean_at_defaults() {
        let s = store();
        assert_eq!(s.get("name"), Some(&json!("")));
        assert_eq!(s.saved("name"), Some(&json!("")));
        assert!(s.changed().is_empty());
    }

    #[test]
    fn set_reports_changes_only_for_defined_values() {
        let mut s = store();

        // Defined -> changed
        let change = s.set("name", json!("a")).unwrap().unwrap();
        assert_eq!(change.previous, json!(""));
        assert_eq!(change.value, json!("a"));

        // Defined -> equal value, no change
        assert!(s.set("name", json!("a")).unwrap().is_none());

        // First-time definition, no change
        assert!(s.set("extra", json!(1)).unwrap().is_none());
        assert_eq!(s.get("extra"), Some(&json!(1)));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut s = store();
        let err = s.set("loading", json!(true)).unwrap_err();
        assert!(matches!(err, BindError::ReservedAttribute { .. }));
        assert!(s.get("loading").is_none());
    }

    #[test]
    fn active_and_reference_never_alias() {
        let mut s = store();
        s.set("meta.color", json!("blue")).unwrap();
        assert_eq!(s.get("meta.color"), Some(&json!("blue")));
        assert_eq!(s.saved("meta.color"), Some(&json!("red")));

        s.sync_all();
        assert_eq!(s.saved("meta.color"), Some(&json!("blue")));

        s.set("meta.color", json!("green")).unwrap();
        assert_eq!(s.saved("meta.color"), Some(&json!("blue")));
    }

    #[test]
    fn changed_is_deep_and_exact() {
        let mut s = store();
        s.set("name", json!("a")).unwrap();
        s.set("meta.color", json!("blue")).unwrap();
        assert_eq!(s.changed(), vec!["name".to_string(), "meta".to_string()]);

        s.set("name", json!("")).unwrap();
        assert_eq!(s.changed(), vec!["meta".to_string()]);

        s.sync_all();
        assert!(s.changed().is_empty());
    }

    #[test]
    fn reset_restores_reference() {
        let mut s = store();
        s.set("name", json!("a")).unwrap();
        s.set("name", json!("b")).unwrap();
        s.reset_all();
        assert_eq!(s.get("name"), Some(&json!("")));
        assert!(s.changed().is_empty());
    }

    #[test]
    fn unset_restores_declared_default() {
        let mut s = store();
        s.set("name", json!("a")).unwrap();
        let change = s.unset("name").unwrap();
        assert_eq!(change.value, json!(""));
        assert_eq!(s.get("name"), Some(&json!("")));

        // Undeclared runtime attribute is removed entirely.
        s.set("extra", json!(1)).unwrap();
        s.unset("extra");
        assert!(s.get("extra").is_none());
    }

    #[test]
    fn partial_sync_and_reset() {
        let mut s = store();
        s.set("id", json!(1)).unwrap();
        s.set("name", json!("a")).unwrap();

        s.sync_attributes(&["id".to_string()]);
        assert_eq!(s.saved("id"), Some(&json!(1)));
        assert_eq!(s.saved("name"), Some(&json!("")));

        s.reset_attributes(&["name".to_string()]);
        assert_eq!(s.get("name"), Some(&json!("")));
        assert_eq!(s.get("id"), Some(&json!(1)));
    }

    #[test]
    fn clear_returns_to_defaults() {
        let mut s = store();
        s.set("name", json!("a")).unwrap();
        s.sync_all();
        s.clear();
        assert_eq!(s.get("name"), Some(&json!("")));
        assert_eq!(s.saved("name"), Some(&json!("")));
        assert!(s.changed().is_empty());
    }
}
