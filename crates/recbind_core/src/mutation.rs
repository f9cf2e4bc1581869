//! Per-attribute mutation chains.
//!
//! Chains are declared per attribute and compiled once into a single
//! composed function, applied on set, sync, or save depending on the
//! schema's mutation policies.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A pure value transform applied to one attribute.
pub type Mutator = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Wraps a plain function as a [`Mutator`].
pub fn mutator<F>(f: F) -> Mutator
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered per-attribute mutation chains with compiled composites.
#[derive(Clone, Default)]
pub struct MutationPipeline {
    chains: IndexMap<String, Vec<Mutator>>,
    compiled: IndexMap<String, Mutator>,
}

impl MutationPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a mutator to an attribute's chain. The chain runs in
    /// declaration order.
    pub fn push(&mut self, attribute: impl Into<String>, mutator: Mutator) {
        self.chains.entry(attribute.into()).or_default().push(mutator);
    }

    /// Compiles one composed function per attribute.
    ///
    /// Idempotent and side-effect-free: recompiling replaces the composite
    /// table from the declared chains.
    pub fn compile(&mut self) {
        self.compiled = self
            .chains
            .iter()
            .map(|(attribute, chain)| {
                let chain = chain.clone();
                let composed: Mutator =
                    Arc::new(move |value| chain.iter().fold(value, |value, f| f(value)));
                (attribute.clone(), composed)
            })
            .collect();
    }

    /// Returns true when the attribute has a compiled chain.
    pub fn has(&self, attribute: &str) -> bool {
        self.compiled.contains_key(attribute)
    }

    /// Applies the attribute's compiled chain; identity when none exists.
    pub fn apply(&self, attribute: &str, value: Value) -> Value {
        match self.compiled.get(attribute) {
            Some(composed) => composed(value),
            None => value,
        }
    }

    /// Applies every compiled chain to the currently-set attributes in
    /// place. Attributes without a chain are untouched.
    pub fn apply_all(&self, attributes: &mut Map<String, Value>) {
        for (name, composed) in &self.compiled {
            if let Some(value) = attributes.get_mut(name) {
                *value = composed(value.take());
            }
        }
    }

    /// Applies compiled chains to a subset of attributes in place.
    pub(crate) fn apply_some(&self, attributes: &mut Map<String, Value>, names: &[String]) {
        for name in names {
            if let (Some(composed), Some(value)) = (self.compiled.get(name), attributes.get_mut(name))
            {
                *value = composed(value.take());
            }
        }
    }
}

impl fmt::Debug for MutationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationPipeline")
            .field("attributes", &self.chains.keys().collect::<Vec<_>>())
            .finish()
    }
}
