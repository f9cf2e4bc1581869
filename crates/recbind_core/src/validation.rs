//! Asynchronous attribute validation.
//!
//! Rules are declared per attribute and evaluated concurrently; a rule may
//! resolve immediately or await other work (a nested record's validation,
//! a lookup). Outputs are normalized into an ordered list of error entries
//! per attribute — a message, or a nested error map for attributes that
//! are themselves records or aggregates.

use crate::error::{BindError, BindResult};
use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One entry in an attribute's error list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ErrorEntry {
    /// A plain error message.
    Message(String),
    /// Errors of a nested record or aggregate.
    Nested(ErrorMap),
}

/// Ordered error entries for one attribute.
pub type AttributeErrors = Vec<ErrorEntry>;

/// Attribute name to error entries, in attribute order.
pub type ErrorMap = IndexMap<String, AttributeErrors>;

/// The outcome of a single validation rule.
#[derive(Debug, Clone)]
pub enum RuleOutcome {
    /// The value passed.
    Pass,
    /// A single error message.
    Message(String),
    /// Several error messages, kept in order.
    Messages(Vec<String>),
    /// Errors of a nested entity.
    Nested(ErrorMap),
}

impl RuleOutcome {
    /// Builds an outcome from an optional message.
    pub fn from_option(message: Option<String>) -> Self {
        match message {
            Some(message) => Self::Message(message),
            None => Self::Pass,
        }
    }
}

impl From<&str> for RuleOutcome {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<String> for RuleOutcome {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

/// A validation rule: receives the current value and the attribute name,
/// resolves with an outcome.
pub type Rule = Arc<dyn Fn(Value, String) -> BoxFuture<'static, RuleOutcome> + Send + Sync>;

/// Wraps a synchronous predicate as a [`Rule`].
pub fn rule<F>(f: F) -> Rule
where
    F: Fn(&Value) -> RuleOutcome + Send + Sync + 'static,
{
    Arc::new(move |value, _attribute| std::future::ready(f(&value)).boxed())
}

/// Wraps an asynchronous predicate as a [`Rule`].
pub fn async_rule<F, Fut>(f: F) -> Rule
where
    F: Fn(Value, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = RuleOutcome> + Send + 'static,
{
    Arc::new(move |value, attribute| f(value, attribute).boxed())
}

/// Per-attribute rule lists, in declaration order.
#[derive(Clone, Default)]
pub struct RuleSet {
    rules: IndexMap<String, Vec<Rule>>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule to an attribute's list.
    pub fn push(&mut self, attribute: impl Into<String>, rule: Rule) {
        self.rules.entry(attribute.into()).or_default().push(rule);
    }

    /// Returns the rules declared for an attribute.
    pub fn rules_for(&self, attribute: &str) -> &[Rule] {
        self.rules.get(attribute).map_or(&[], Vec::as_slice)
    }

    /// Returns true when the attribute has at least one rule.
    pub fn has(&self, attribute: &str) -> bool {
        self.rules.contains_key(attribute)
    }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSet")
            .field("attributes", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Capability of nested entities that can validate themselves.
///
/// Records and aggregates implement this; when recursive validation is
/// enabled, an attached nested entity's validation joins the owning
/// attribute's rule batch and its errors land as a nested entry.
#[async_trait]
pub trait Validates: Send + Sync {
    /// Runs validation, resolving with the entity's error map (empty when
    /// everything passed).
    async fn validation_errors(&self) -> BindResult<ErrorMap>;
}

/// Runs every rule for one attribute concurrently and normalizes the
/// outcomes into an ordered entry list, flat except for nested maps.
pub(crate) async fn run_rules(rules: &[Rule], value: &Value, attribute: &str) -> AttributeErrors {
    let outcomes = join_all(
        rules
            .iter()
            .map(|rule| rule(value.clone(), attribute.to_string())),
    )
    .await;

    let mut entries = AttributeErrors::new();
    for outcome in outcomes {
        match outcome {
            RuleOutcome::Pass => {}
            RuleOutcome::Message(message) => entries.push(ErrorEntry::Message(message)),
            RuleOutcome::Messages(messages) => {
                entries.extend(messages.into_iter().map(ErrorEntry::Message));
            }
            RuleOutcome::Nested(map) => {
                if !map.is_empty() {
                    entries.push(ErrorEntry::Nested(map));
                }
            }
        }
    }
    entries
}

/// Parses one attribute's error payload from a server response.
///
/// Strings become messages, objects become nested maps, arrays recurse
/// one level; anything else is discarded as invalid output.
pub(crate) fn entries_from_value(value: &Value) -> AttributeErrors {
    match value {
        Value::String(message) => vec![ErrorEntry::Message(message.clone())],
        Value::Object(_) => match nested_from_value(value) {
            Some(map) => vec![ErrorEntry::Nested(map)],
            None => Vec::new(),
        },
        Value::Array(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::String(message) => Some(ErrorEntry::Message(message.clone())),
                Value::Object(_) => nested_from_value(item).map(ErrorEntry::Nested),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn nested_from_value(value: &Value) -> Option<ErrorMap> {
    let object = value.as_object()?;
    let mut map = ErrorMap::new();
    for (name, payload) in object {
        let entries = entries_from_value(payload);
        if !entries.is_empty() {
            map.insert(name.clone(), entries);
        }
    }
    Some(map)
}

/// Parses a whole validation payload: must be an object keyed by
/// attribute name, anything else violates the response contract.
pub(crate) fn error_map_from_value(value: &Value) -> BindResult<ErrorMap> {
    match value {
        Value::Object(_) => Ok(nested_from_value(value).unwrap_or_default()),
        other => Err(BindError::response(format!(
            "validation payload must be an object, got {other}"
        ))),
    }
}

/// Truncates every attribute's entries to the first error.
pub(crate) fn keep_first_errors(map: &mut ErrorMap) {
    for entries in map.values_mut() {
        entries.truncate(1);
    }
}
