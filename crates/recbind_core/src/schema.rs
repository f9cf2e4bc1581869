//! Declarative schemas and the construction context.
//!
//! Attribute names, defaults, mutation chains, validation rules, routes,
//! and options are all declared up front on a [`Schema`]; records expose
//! uniform `get`/`set` accessors against it. A [`Context`] pairs a schema
//! with the transport and uid source and is the only way records and
//! aggregates are constructed.

use crate::aggregate::Aggregate;
use crate::error::{BindError, BindResult};
use crate::mutation::{MutationPipeline, Mutator};
use crate::options::Options;
use crate::record::Record;
use crate::routes::RouteSet;
use crate::store::RESERVED_NAMES;
use crate::transport::Transport;
use crate::uid::{RandomUids, Uid, UidSource};
use crate::validation::{Rule, RuleSet};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Declarative description of a record type.
#[derive(Debug)]
pub struct Schema {
    attributes: IndexMap<String, Value>,
    mutations: MutationPipeline,
    rules: RuleSet,
    record_routes: RouteSet,
    aggregate_routes: RouteSet,
    options: Options,
}

impl Schema {
    /// Starts building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Declared attribute names and default values, in declaration order.
    pub fn attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }

    /// The compiled mutation pipeline.
    pub fn mutations(&self) -> &MutationPipeline {
        &self.mutations
    }

    /// The declared validation rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Routes for single-record operations.
    pub fn record_routes(&self) -> &RouteSet {
        &self.record_routes
    }

    /// Routes for aggregate operations.
    pub fn aggregate_routes(&self) -> &RouteSet {
        &self.aggregate_routes
    }

    /// The behavior switches.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// Builder for [`Schema`].
#[derive(Default)]
pub struct SchemaBuilder {
    attributes: IndexMap<String, Value>,
    mutations: MutationPipeline,
    rules: RuleSet,
    record_routes: RouteSet,
    aggregate_routes: RouteSet,
    options: Options,
}

impl SchemaBuilder {
    /// Declares an attribute with its default value.
    pub fn attribute(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), default.into());
        self
    }

    /// Appends a mutator to an attribute's chain.
    pub fn mutate<F>(mut self, attribute: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.mutations.push(attribute, Arc::new(f) as Mutator);
        self
    }

    /// Appends a validation rule to an attribute.
    pub fn rule(mut self, attribute: impl Into<String>, rule: Rule) -> Self {
        self.rules.push(attribute, rule);
        self
    }

    /// Sets the single-record routes.
    pub fn record_routes(mut self, routes: RouteSet) -> Self {
        self.record_routes = routes;
        self
    }

    /// Sets the aggregate routes.
    pub fn aggregate_routes(mut self, routes: RouteSet) -> Self {
        self.aggregate_routes = routes;
        self
    }

    /// Replaces the options.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Compiles the mutation pipeline and validates attribute names.
    ///
    /// Declaring a reserved internal name is a hard error.
    pub fn build(mut self) -> BindResult<Schema> {
        for name in self.attributes.keys() {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(BindError::ReservedAttribute { name: name.clone() });
            }
        }
        self.mutations.compile();
        Ok(Schema {
            attributes: self.attributes,
            mutations: self.mutations,
            rules: self.rules,
            record_routes: self.record_routes,
            aggregate_routes: self.aggregate_routes,
            options: self.options,
        })
    }
}

/// Shared construction context: schema + transport + uid source.
///
/// Cheap to clone; all records and aggregates created through one context
/// share the same collaborators.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    schema: Arc<Schema>,
    transport: Arc<dyn Transport>,
    uids: Arc<dyn UidSource>,
}

impl Context {
    /// Creates a context with the default (random) uid source.
    pub fn new(schema: Schema, transport: impl Transport + 'static) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                schema: Arc::new(schema),
                transport: Arc::new(transport),
                uids: Arc::new(RandomUids),
            }),
        }
    }

    /// Replaces the uid source.
    pub fn with_uid_source(self, uids: impl UidSource + 'static) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                schema: Arc::clone(&self.inner.schema),
                transport: Arc::clone(&self.inner.transport),
                uids: Arc::new(uids),
            }),
        }
    }

    /// The schema records of this context follow.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// The transport collaborator.
    pub fn transport(&self) -> &dyn Transport {
        &*self.inner.transport
    }

    /// Creates an empty record at the declared defaults.
    pub fn record(&self) -> Record {
        Record::at_defaults(self.clone())
    }

    /// Creates a record with initial attributes merged over the defaults.
    pub fn record_with(&self, attributes: Map<String, Value>) -> BindResult<Record> {
        Record::with_attributes(self.clone(), &attributes)
    }

    /// Creates an empty aggregate of this context's record type.
    pub fn aggregate(&self) -> Aggregate {
        Aggregate::new(self.clone())
    }

    /// Materializes plain data into a record.
    pub(crate) fn materialize(&self, data: &Value) -> BindResult<Record> {
        match data.as_object() {
            Some(map) => Record::with_attributes(self.clone(), map),
            None => Err(BindError::response(format!(
                "model data must be an object, got {data}"
            ))),
        }
    }

    /// Draws the next identity token.
    pub(crate) fn next_uid(&self) -> Uid {
        self.inner.uids.next_uid()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("schema", &self.inner.schema)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::uid::SequentialUids;
    use serde_json::json;

    #[test]
    fn reserved_attribute_names_fail_the_build() {
        let result = Schema::builder().attribute("errors", json!(null)).build();
        assert!(matches!(result, Err(BindError::ReservedAttribute { .. })));
    }

    #[test]
    fn builder_declares_in_order() {
        let schema = Schema::builder()
            .attribute("id", json!(null))
            .attribute("name", json!(""))
            .build()
            .unwrap();
        let names: Vec<&String> = schema.attributes().keys().collect();
        assert_eq!(names, ["id", "name"]);
    }

    #[test]
    fn context_uid_source_is_deterministic_when_injected() {
        let schema = Schema::builder().attribute("id", json!(null)).build().unwrap();
        let context =
            Context::new(schema, MockTransport::new()).with_uid_source(SequentialUids::new());

        let a = context.record();
        let b = context.record();
        assert_ne!(a.uid(), b.uid());
    }
}
