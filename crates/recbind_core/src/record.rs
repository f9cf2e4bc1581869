//! The single-entity abstraction.
//!
//! A `Record` is a cheap-to-clone handle to one logical entity: exactly
//! one instance of state per entity, shared by reference across every
//! aggregate that contains it, so any mutation — attributes and in-flight
//! flags alike — is immediately visible to all of them.

use crate::aggregate::AggregateInner;
use crate::error::{BindError, BindResult};
use crate::events::{Event, EventFeed};
use crate::lifecycle::{execute, Operation, Preflight};
use crate::observe::{WriteObserver, WriteTarget};
use crate::routes;
use crate::schema::{Context, Schema};
use crate::store::{AttributeStore, Change};
use crate::transport::{require_data, RequestDescriptor, Response, TransportFailure};
use crate::uid::Uid;
use crate::validation::{
    self, error_map_from_value, keep_first_errors, AttributeErrors, ErrorEntry, ErrorMap,
    Validates,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

pub(crate) struct RecordInner {
    uid: Uid,
    context: Context,
    state: RwLock<RecordState>,
    memberships: RwLock<IndexMap<Uid, Weak<AggregateInner>>>,
    nested: RwLock<IndexMap<String, Arc<dyn Validates>>>,
    observer: RwLock<Option<Arc<dyn WriteObserver>>>,
    events: EventFeed,
}

struct RecordState {
    store: AttributeStore,
    errors: ErrorMap,
    loading: bool,
    saving: bool,
    deleting: bool,
    fatal: bool,
}

/// A single observable entity bound to a remote resource.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    pub(crate) fn at_defaults(context: Context) -> Self {
        let store = AttributeStore::new(context.schema().attributes().clone());
        Self {
            inner: Arc::new(RecordInner {
                uid: context.next_uid(),
                context,
                state: RwLock::new(RecordState {
                    store,
                    errors: ErrorMap::new(),
                    loading: false,
                    saving: false,
                    deleting: false,
                    fatal: false,
                }),
                memberships: RwLock::new(IndexMap::new()),
                nested: RwLock::new(IndexMap::new()),
                observer: RwLock::new(None),
                events: EventFeed::new(),
            }),
        }
    }

    pub(crate) fn with_attributes(context: Context, attributes: &Map<String, Value>) -> BindResult<Self> {
        let record = Self::at_defaults(context);
        for (name, value) in attributes {
            record.set(name, value.clone())?;
        }
        // Initial attributes become the reference snapshot: a freshly
        // constructed record is never dirty.
        record.sync();
        Ok(record)
    }

    /// The process-unique identity token.
    pub fn uid(&self) -> Uid {
        self.inner.uid
    }

    fn schema(&self) -> &Schema {
        self.inner.context.schema()
    }

    /// Subscribes to this record's events.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Installs the reactive-binding observer.
    pub fn observe(&self, observer: Arc<dyn WriteObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    fn notify(&self, target: WriteTarget) {
        let observer = self.inner.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_write(target);
        }
    }

    fn emit(&self, event: Event) {
        self.inner.events.emit(event);
    }

    fn emit_changes(&self, changes: Vec<Change>) {
        for change in changes {
            self.emit(Event::Change {
                attribute: change.attribute,
                previous: change.previous,
                value: change.value,
            });
        }
    }

    // ---- attribute access ------------------------------------------------

    /// Reads an active value by dotted path.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.inner.state.read().store.get(path).cloned()
    }

    /// Reads an active value by dotted path, with a fallback.
    pub fn get_or(&self, path: &str, fallback: Value) -> Value {
        self.inner.state.read().store.get_or(path, fallback)
    }

    /// Reads a reference (saved) value by dotted path.
    pub fn saved(&self, path: &str) -> Option<Value> {
        self.inner.state.read().store.saved(path).cloned()
    }

    /// Reads a reference value by dotted path, with a fallback.
    pub fn saved_or(&self, path: &str, fallback: Value) -> Value {
        self.inner.state.read().store.saved_or(path, fallback)
    }

    /// Returns a deep copy of the active attribute map.
    pub fn attributes(&self) -> Map<String, Value> {
        self.inner.state.read().store.active().clone()
    }

    /// Returns a deep copy of the reference attribute map.
    pub fn saved_attributes(&self) -> Map<String, Value> {
        self.inner.state.read().store.reference().clone()
    }

    /// Writes an active value by dotted path.
    ///
    /// Applies the attribute's mutation chain when `mutate_on_change` is
    /// set. Emits a `change` event when an already-defined value actually
    /// changed.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> BindResult<()> {
        let mut value = value.into();
        if self.schema().options().mutate_on_change {
            value = self.schema().mutations().apply(path, value);
        }
        let change = self.inner.state.write().store.set(path, value)?;
        self.notify(WriteTarget::Active);
        if let Some(change) = change {
            self.emit(Event::Change {
                attribute: change.attribute,
                previous: change.previous,
                value: change.value,
            });
        }
        Ok(())
    }

    /// Batch form of [`set`](Self::set): iterates the map per key.
    pub fn set_many(&self, attributes: &Map<String, Value>) -> BindResult<()> {
        for (name, value) in attributes {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Sets a value and, when `validate_on_change` is enabled, validates
    /// the attribute as part of the same call.
    pub async fn set_and_validate(
        &self,
        path: &str,
        value: impl Into<Value> + Send,
    ) -> BindResult<AttributeErrors> {
        self.set(path, value)?;
        if self.schema().options().validate_on_change {
            self.validate_attribute(crate::value::root_key(path)).await
        } else {
            Ok(AttributeErrors::new())
        }
    }

    /// Restores an attribute to its declared default.
    pub fn unset(&self, path: &str) {
        let change = self.inner.state.write().store.unset(path);
        self.notify(WriteTarget::Active);
        if let Some(change) = change {
            self.emit(Event::Change {
                attribute: change.attribute,
                previous: change.previous,
                value: change.value,
            });
        }
    }

    /// Restores several attributes to their declared defaults.
    pub fn unset_many(&self, paths: &[&str]) {
        for path in paths {
            self.unset(path);
        }
    }

    /// Collapses active state into the reference snapshot, applying the
    /// mutation pipeline first when `mutate_before_sync` is set.
    pub fn sync(&self) {
        {
            let mut state = self.inner.state.write();
            sync_locked(&mut state, self.schema());
        }
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Reference);
        self.emit(Event::Sync);
    }

    /// Syncs only the named attributes.
    pub fn sync_only(&self, names: &[&str]) {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        {
            let mut state = self.inner.state.write();
            if self.schema().options().mutate_before_sync {
                self.schema()
                    .mutations()
                    .apply_some(state.store.active_mut(), &names);
            }
            state.store.sync_attributes(&names);
        }
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Reference);
        self.emit(Event::Sync);
    }

    /// Collapses the reference snapshot back into active state and clears
    /// validation errors.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.write();
            state.store.reset_all();
            state.errors.clear();
        }
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Errors);
        self.emit(Event::Reset);
    }

    /// Resets only the named attributes, clearing their errors.
    pub fn reset_only(&self, names: &[&str]) {
        let owned: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        {
            let mut state = self.inner.state.write();
            state.store.reset_attributes(&owned);
            for name in &owned {
                state.errors.shift_remove(name);
            }
        }
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Errors);
        self.emit(Event::Reset);
    }

    /// Restores both states to the declared defaults and clears all
    /// errors and flags.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.write();
            state.store.clear();
            state.errors.clear();
            state.loading = false;
            state.saving = false;
            state.deleting = false;
            state.fatal = false;
        }
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Reference);
        self.notify(WriteTarget::Errors);
        self.notify(WriteTarget::State);
    }

    /// Names of attributes whose active value deep-differs from the
    /// reference snapshot. The sole authority for dirty tracking.
    pub fn changed(&self) -> Vec<String> {
        self.inner.state.read().store.changed()
    }

    /// Returns true when the named attribute is dirty.
    pub fn is_changed(&self, name: &str) -> bool {
        self.inner.state.read().store.is_changed(name)
    }

    // ---- identity --------------------------------------------------------

    /// The record's business identifier, when set and non-null.
    pub fn identifier(&self) -> Option<Value> {
        let identifier = &self.schema().options().identifier;
        self.inner
            .state
            .read()
            .store
            .get(identifier)
            .filter(|value| !value.is_null())
            .cloned()
    }

    /// Returns true when the record has no identifier yet.
    pub fn is_new(&self) -> bool {
        self.identifier().is_none()
    }

    // ---- errors and flags ------------------------------------------------

    /// The current validation error map.
    pub fn errors(&self) -> ErrorMap {
        self.inner.state.read().errors.clone()
    }

    /// Returns true when any attribute has errors.
    pub fn has_errors(&self) -> bool {
        !self.inner.state.read().errors.is_empty()
    }

    /// Clears all validation errors.
    pub fn clear_errors(&self) {
        self.inner.state.write().errors.clear();
        self.notify(WriteTarget::Errors);
    }

    /// Returns true while a fetch is in flight.
    pub fn loading(&self) -> bool {
        self.inner.state.read().loading
    }

    /// Returns true while a save is in flight.
    pub fn saving(&self) -> bool {
        self.inner.state.read().saving
    }

    /// Returns true while a delete is in flight.
    pub fn deleting(&self) -> bool {
        self.inner.state.read().deleting
    }

    /// Returns true when the last operation failed fatally.
    pub fn fatal(&self) -> bool {
        self.inner.state.read().fatal
    }

    // ---- nested entities -------------------------------------------------

    /// Attaches a nested entity to an attribute; with recursive
    /// validation enabled its errors join the attribute's rule batch.
    pub fn attach_nested(&self, attribute: impl Into<String>, entity: Arc<dyn Validates>) {
        self.inner.nested.write().insert(attribute.into(), entity);
    }

    /// Detaches the nested entity from an attribute.
    pub fn detach_nested(&self, attribute: &str) {
        self.inner.nested.write().shift_remove(attribute);
    }

    // ---- validation ------------------------------------------------------

    /// Validates one attribute: every declared rule runs concurrently
    /// against its current active value, together with an attached nested
    /// entity's validation when the recursive policy is on. The
    /// attribute's entry in the error map is set or cleared as a side
    /// effect.
    pub async fn validate_attribute(&self, name: &str) -> BindResult<AttributeErrors> {
        let (value, rules, nested) = {
            let state = self.inner.state.read();
            let value = state
                .store
                .get(name)
                .cloned()
                .ok_or_else(|| BindError::UnknownAttribute {
                    name: name.to_string(),
                })?;
            let rules = self.schema().rules().rules_for(name).to_vec();
            let nested = if self.schema().options().validate_recursively {
                self.inner.nested.read().get(name).cloned()
            } else {
                None
            };
            (value, rules, nested)
        };

        let nested_errors = async {
            match nested {
                Some(entity) => entity.validation_errors().await.map(Some),
                None => Ok(None),
            }
        };
        let (mut entries, nested_errors) =
            futures_util::future::join(validation::run_rules(&rules, &value, name), nested_errors)
                .await;
        if let Some(map) = nested_errors? {
            if !map.is_empty() {
                entries.push(ErrorEntry::Nested(map));
            }
        }
        if self.schema().options().use_first_error_only {
            entries.truncate(1);
        }

        {
            let mut state = self.inner.state.write();
            if entries.is_empty() {
                state.errors.shift_remove(name);
            } else {
                state.errors.insert(name.to_string(), entries.clone());
            }
        }
        self.notify(WriteTarget::Errors);
        Ok(entries)
    }

    /// Validates every currently-set attribute concurrently, resolving
    /// with a map of only the attributes that produced errors.
    pub async fn validate(&self) -> BindResult<ErrorMap> {
        let names = self.inner.state.read().store.attribute_names();
        self.validate_names(&names).await
    }

    /// Validates only the named attributes.
    pub async fn validate_only(&self, names: &[&str]) -> BindResult<ErrorMap> {
        let owned: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        self.validate_names(&owned).await
    }

    async fn validate_names(&self, names: &[String]) -> BindResult<ErrorMap> {
        let results = join_all(names.iter().map(|name| async move {
            (name.clone(), self.validate_attribute(name).await)
        }))
        .await;

        let mut map = ErrorMap::new();
        for (name, result) in results {
            let entries = result?;
            if !entries.is_empty() {
                map.insert(name, entries);
            }
        }
        Ok(map)
    }

    // ---- request lifecycle -----------------------------------------------

    /// Loads the record's attributes from the server.
    ///
    /// A fetch while one is already in flight settles as a silent no-op.
    pub async fn fetch(&self) -> BindResult<Option<Response>> {
        execute(
            Operation::Fetch,
            self.inner.context.transport(),
            async {
                {
                    let mut state = self.inner.state.write();
                    if state.loading {
                        return Ok(Preflight::Skip);
                    }
                    state.loading = true;
                }
                self.notify(WriteTarget::State);
                Ok(Preflight::Continue)
            },
            || self.build_request(Operation::Fetch),
            |response| self.handle_fetch_success(response),
            |failure| self.handle_fetch_failure(failure),
        )
        .await
    }

    /// Persists the record: create when new, update otherwise.
    ///
    /// Validation runs first and an invalid record never reaches the
    /// transport. With `save_unchanged` off, saving a clean record is a
    /// redundant no-op.
    pub async fn save(&self) -> BindResult<Option<Response>> {
        let was_new = self.is_new();
        execute(
            Operation::Save,
            self.inner.context.transport(),
            self.save_preflight(),
            || self.build_save_request(was_new),
            |response| self.apply_save_success(response.and_then(Response::data), was_new),
            |failure| self.apply_save_failure(failure),
        )
        .await
    }

    /// Deletes the record on the server, then clears local state and
    /// deregisters from every containing aggregate.
    pub async fn delete(&self) -> BindResult<Option<Response>> {
        execute(
            Operation::Delete,
            self.inner.context.transport(),
            async {
                {
                    let mut state = self.inner.state.write();
                    if state.deleting {
                        return Ok(Preflight::Skip);
                    }
                    state.deleting = true;
                }
                self.notify(WriteTarget::State);
                Ok(Preflight::Continue)
            },
            || self.build_request(Operation::Delete),
            |_response| {
                self.apply_delete_success();
                Ok(())
            },
            |failure| self.apply_fatal_delete_failure(failure.into_error()),
        )
        .await
    }

    async fn save_preflight(&self) -> BindResult<Preflight> {
        {
            let mut state = self.inner.state.write();
            if state.saving {
                return Ok(Preflight::Skip);
            }
            let identifier = &self.schema().options().identifier;
            let exists = state
                .store
                .get(identifier)
                .map_or(false, |value| !value.is_null());
            if !self.schema().options().save_unchanged
                && exists
                && state.store.changed().is_empty()
            {
                return Ok(Preflight::Redundant);
            }
            state.saving = true;
            if self.schema().options().mutate_before_save {
                self.schema()
                    .mutations()
                    .apply_all(state.store.active_mut());
            }
        }
        self.notify(WriteTarget::State);
        self.notify(WriteTarget::Active);

        let errors = self.validate().await?;
        if !errors.is_empty() {
            self.inner.state.write().saving = false;
            self.notify(WriteTarget::State);
            return Err(BindError::validation(errors));
        }
        Ok(Preflight::Continue)
    }

    fn build_request(&self, operation: Operation) -> BindResult<RequestDescriptor> {
        let schema = self.schema();
        let method = match operation {
            Operation::Fetch => schema.options().methods.fetch,
            Operation::Save => schema.options().methods.update,
            Operation::Delete => schema.options().methods.delete,
        };
        let template = schema.record_routes().template(operation)?;
        let url = routes::interpolate(
            template,
            &self.route_parameters(),
            &schema.options().route_parameter_pattern,
        )?;
        Ok(RequestDescriptor::new(method, url))
    }

    fn build_save_request(&self, was_new: bool) -> BindResult<RequestDescriptor> {
        let schema = self.schema();
        let options = schema.options();
        let method = if was_new {
            options.methods.create
        } else if options.patch {
            options.methods.patch
        } else {
            options.methods.update
        };
        let template = schema.record_routes().template(Operation::Save)?;
        let url = routes::interpolate(
            template,
            &self.route_parameters(),
            &options.route_parameter_pattern,
        )?;
        Ok(RequestDescriptor::new(method, url).with_body(self.save_body(was_new)))
    }

    /// Route parameters: the non-null top-level active attributes.
    fn route_parameters(&self) -> Map<String, Value> {
        self.inner
            .state
            .read()
            .store
            .active()
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn save_body(&self, was_new: bool) -> Value {
        let state = self.inner.state.read();
        let options = self.schema().options();
        if options.patch && !was_new {
            let mut body = Map::new();
            for name in state.store.changed() {
                if let Some(value) = state.store.active().get(&name) {
                    body.insert(name, value.clone());
                }
            }
            Value::Object(body)
        } else {
            Value::Object(state.store.active().clone())
        }
    }

    fn handle_fetch_success(&self, response: Option<&Response>) -> BindResult<()> {
        let data = match response.map(require_data).transpose() {
            Ok(data) => data.cloned(),
            Err(error) => return Err(self.fail_fetch(error)),
        };
        let attributes = match data.as_ref().and_then(Value::as_object) {
            Some(map) => map.clone(),
            None => {
                return Err(self.fail_fetch(BindError::response(
                    "fetch response data must be an object",
                )))
            }
        };

        let merged = {
            let mut state = self.inner.state.write();
            merge_locked(&mut state, &attributes).map(|changes| {
                sync_locked(&mut state, self.schema());
                state.loading = false;
                state.fatal = false;
                changes
            })
        };
        let changes = match merged {
            Ok(changes) => changes,
            Err(error) => return Err(self.fail_fetch(error)),
        };
        self.emit_changes(changes);
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Reference);
        self.notify(WriteTarget::State);
        self.emit(Event::Sync);
        self.emit(Event::Fetch { error: None });
        Ok(())
    }

    fn fail_fetch(&self, error: BindError) -> BindError {
        {
            let mut state = self.inner.state.write();
            state.fatal = true;
            state.loading = false;
        }
        self.notify(WriteTarget::State);
        self.emit(Event::Fetch {
            error: Some(error.to_string()),
        });
        error
    }

    fn handle_fetch_failure(&self, failure: &TransportFailure) -> BindError {
        self.fail_fetch(failure.into_error())
    }

    /// Applies a save success: clears errors, updates identity and
    /// attributes from the response data, syncs, and re-registers into
    /// every linked aggregate. Shared by single saves and bulk
    /// reconciliation.
    pub(crate) fn apply_save_success(&self, data: Option<&Value>, was_new: bool) -> BindResult<()> {
        match self.try_apply_save_data(data) {
            Ok(changes) => {
                self.emit_changes(changes);
                self.notify(WriteTarget::Active);
                self.notify(WriteTarget::Reference);
                self.notify(WriteTarget::Errors);
                self.notify(WriteTarget::State);
                self.reregister_memberships();
                self.emit(if was_new { Event::Create } else { Event::Update });
                self.emit(Event::Save { error: None });
                Ok(())
            }
            Err(error) => {
                {
                    let mut state = self.inner.state.write();
                    state.saving = false;
                    state.fatal = true;
                }
                self.notify(WriteTarget::State);
                self.emit(Event::Save {
                    error: Some(error.to_string()),
                });
                Err(error)
            }
        }
    }

    fn try_apply_save_data(&self, data: Option<&Value>) -> BindResult<Vec<Change>> {
        let schema = self.schema();
        let mut state = self.inner.state.write();
        state.errors.clear();

        let changes = match data {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(attributes)) => {
                let attributes = attributes.clone();
                merge_locked(&mut state, &attributes)?
            }
            Some(Value::Array(_)) => {
                return Err(BindError::response(
                    "save response data must be an object or identifier",
                ))
            }
            Some(scalar) => {
                let identifier = schema.options().identifier.clone();
                let current = state
                    .store
                    .get(&identifier)
                    .filter(|value| !value.is_null())
                    .cloned();
                if let Some(current) = current {
                    if &current != scalar && !schema.options().overwrite_identifier {
                        return Err(BindError::IdentifierConflict {
                            current,
                            incoming: scalar.clone(),
                        });
                    }
                }
                state.store.set(&identifier, scalar.clone())?.into_iter().collect()
            }
        };

        sync_locked(&mut state, schema);
        state.saving = false;
        state.fatal = false;
        Ok(changes)
    }

    /// Maps a save failure to the caller's error: validation statuses
    /// apply returned per-attribute errors, anything else is fatal.
    pub(crate) fn apply_save_failure(&self, failure: &TransportFailure) -> BindError {
        let options = self.schema().options();
        if failure.status() == Some(options.validation_error_status) {
            let payload = failure
                .response
                .as_ref()
                .and_then(Response::validation_errors);
            match payload.map(error_map_from_value).transpose() {
                Ok(map) => {
                    let mut map = map.unwrap_or_default();
                    if options.use_first_error_only {
                        keep_first_errors(&mut map);
                    }
                    self.apply_response_errors(map.clone());
                    BindError::validation(map)
                }
                Err(shape_error) => self.apply_fatal_save_failure(shape_error),
            }
        } else {
            self.apply_fatal_save_failure(failure.into_error())
        }
    }

    /// Applies server-reported validation errors: error state, saving
    /// cleared, not fatal.
    pub(crate) fn apply_response_errors(&self, errors: ErrorMap) {
        {
            let mut state = self.inner.state.write();
            state.errors = errors;
            state.saving = false;
        }
        self.notify(WriteTarget::Errors);
        self.notify(WriteTarget::State);
        self.emit(Event::Save {
            error: Some("validation failed".to_string()),
        });
    }

    /// Applies a fatal save failure: validation errors are cleared since
    /// they are not the cause.
    pub(crate) fn apply_fatal_save_failure(&self, error: BindError) -> BindError {
        {
            let mut state = self.inner.state.write();
            state.errors.clear();
            state.fatal = true;
            state.saving = false;
        }
        self.notify(WriteTarget::Errors);
        self.notify(WriteTarget::State);
        self.emit(Event::Save {
            error: Some(error.to_string()),
        });
        error
    }

    /// Applies a delete success: all state back to defaults, deregistered
    /// from every containing aggregate.
    pub(crate) fn apply_delete_success(&self) {
        {
            let mut state = self.inner.state.write();
            state.store.clear();
            state.errors.clear();
            state.loading = false;
            state.saving = false;
            state.deleting = false;
            state.fatal = false;
        }
        self.notify(WriteTarget::Active);
        self.notify(WriteTarget::Reference);
        self.notify(WriteTarget::Errors);
        self.notify(WriteTarget::State);

        let memberships: Vec<Weak<AggregateInner>> =
            self.inner.memberships.write().drain(..).map(|(_, w)| w).collect();
        for weak in memberships {
            if let Some(aggregate) = weak.upgrade() {
                AggregateInner::remove_record(&aggregate, self);
            }
        }
        self.emit(Event::Delete { error: None });
    }

    pub(crate) fn apply_fatal_delete_failure(&self, error: BindError) -> BindError {
        {
            let mut state = self.inner.state.write();
            state.fatal = true;
            state.deleting = false;
        }
        self.notify(WriteTarget::State);
        self.emit(Event::Delete {
            error: Some(error.to_string()),
        });
        error
    }

    // ---- bulk-operation hooks (aggregate side) ---------------------------

    /// Marks the record saving and runs the pre-save mutation pass.
    pub(crate) fn begin_save(&self) {
        {
            let mut state = self.inner.state.write();
            state.saving = true;
            if self.schema().options().mutate_before_save {
                self.schema()
                    .mutations()
                    .apply_all(state.store.active_mut());
            }
        }
        self.notify(WriteTarget::State);
        self.notify(WriteTarget::Active);
    }

    /// Clears the saving flag without touching anything else.
    pub(crate) fn end_save_flag(&self) {
        self.inner.state.write().saving = false;
        self.notify(WriteTarget::State);
    }

    /// Marks the record deleting.
    pub(crate) fn begin_delete(&self) {
        self.inner.state.write().deleting = true;
        self.notify(WriteTarget::State);
    }

    // ---- aggregate back-references ---------------------------------------

    pub(crate) fn register_aggregate(&self, uid: Uid, handle: Weak<AggregateInner>) {
        self.inner.memberships.write().insert(uid, handle);
    }

    pub(crate) fn deregister_aggregate(&self, uid: Uid) {
        self.inner.memberships.write().shift_remove(&uid);
    }

    /// Returns true when the record currently belongs to the aggregate.
    pub(crate) fn belongs_to(&self, uid: Uid) -> bool {
        self.inner.memberships.read().contains_key(&uid)
    }

    fn reregister_memberships(&self) {
        let memberships: Vec<Weak<AggregateInner>> = self
            .inner
            .memberships
            .read()
            .values()
            .cloned()
            .collect();
        for weak in memberships {
            match weak.upgrade() {
                Some(aggregate) => {
                    AggregateInner::ensure_member(&aggregate, self);
                }
                None => warn!(uid = %self.uid(), "dropping dead aggregate back-reference"),
            }
        }
    }
}

fn sync_locked(state: &mut RecordState, schema: &Schema) {
    if schema.options().mutate_before_sync {
        schema.mutations().apply_all(state.store.active_mut());
    }
    state.store.sync_all();
}

/// Deep-merges response attributes over the current active state, one
/// `set` per top-level key so change events fire naturally. Declared
/// attributes missing from the response keep their current value (gaps
/// were filled from defaults at construction).
fn merge_locked(state: &mut RecordState, incoming: &Map<String, Value>) -> BindResult<Vec<Change>> {
    let mut changes = Vec::new();
    for (name, value) in incoming {
        let merged = match (state.store.active().get(name), value) {
            (Some(current @ Value::Object(_)), Value::Object(_)) => {
                let mut merged = current.clone();
                crate::value::deep_merge(&mut merged, value);
                merged
            }
            _ => value.clone(),
        };
        if let Some(change) = state.store.set(name, merged)? {
            changes.push(change);
        }
    }
    Ok(changes)
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.inner.uid == other.inner.uid
    }
}

impl Eq for Record {}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Record")
            .field("uid", &self.inner.uid)
            .field("active", state.store.active())
            .field("loading", &state.loading)
            .field("saving", &state.saving)
            .field("deleting", &state.deleting)
            .field("fatal", &state.fatal)
            .finish()
    }
}

#[async_trait]
impl Validates for Record {
    async fn validation_errors(&self) -> BindResult<ErrorMap> {
        self.validate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Method, Options};
    use crate::routes::RouteSet;
    use crate::schema::Context;
    use crate::transport::MockTransport;
    use crate::uid::SequentialUids;
    use crate::validation::{rule, RuleOutcome};
    use serde_json::json;

    fn schema_with(options: Options) -> crate::schema::Schema {
        crate::schema::Schema::builder()
            .attribute("id", json!(null))
            .attribute("name", json!(""))
            .attribute("tags", json!([]))
            .rule(
                "name",
                rule(|value| match value.as_str() {
                    Some("") => RuleOutcome::from("name must not be empty"),
                    _ => RuleOutcome::Pass,
                }),
            )
            .record_routes(
                RouteSet::new()
                    .with_fetch("/api/tasks/{id}")
                    .with_save("/api/tasks")
                    .with_delete("/api/tasks/{id}"),
            )
            .options(options)
            .build()
            .unwrap()
    }

    fn context_with(options: Options) -> (Context, std::sync::Arc<MockTransport>) {
        let transport = std::sync::Arc::new(MockTransport::new());
        let context = Context::new(schema_with(options), std::sync::Arc::clone(&transport))
            .with_uid_source(SequentialUids::new());
        (context, transport)
    }

    fn context() -> (Context, std::sync::Arc<MockTransport>) {
        context_with(Options::default())
    }

    #[test]
    fn fresh_records_are_clean() {
        let (context, _) = context();
        let record = context.record();
        assert!(record.changed().is_empty());
        assert!(record.is_new());
        assert_eq!(record.get("name"), Some(json!("")));

        let record = context
            .record_with(json!({"name": "a"}).as_object().unwrap().clone())
            .unwrap();
        assert!(record.changed().is_empty());
        assert_eq!(record.get("name"), Some(json!("a")));
        assert_eq!(record.saved("name"), Some(json!("a")));
    }

    #[test]
    fn sync_isolates_active_from_reference() {
        let (context, _) = context();
        let record = context.record();

        record.set("tags", json!(["a"])).unwrap();
        record.sync();
        assert_eq!(record.saved("tags"), record.get("tags"));

        record.set("tags", json!(["a", "b"])).unwrap();
        assert_eq!(record.saved("tags"), Some(json!(["a"])));
        assert_eq!(record.changed(), vec!["tags".to_string()]);
    }

    #[test]
    fn reset_round_trips_regardless_of_intermediate_sets() {
        let (context, _) = context();
        let record = context.record();

        record.set("name", json!("a")).unwrap();
        record.set("name", json!("b")).unwrap();
        record.set("name", json!("c")).unwrap();
        record.reset();

        assert_eq!(record.get("name"), record.saved("name"));
        assert!(record.changed().is_empty());
    }

    #[test]
    fn reserved_names_are_hard_errors() {
        let (context, _) = context();
        let record = context.record();
        assert!(matches!(
            record.set("fatal", json!(true)),
            Err(BindError::ReservedAttribute { .. })
        ));
    }

    #[test]
    fn change_events_fire_only_on_actual_changes() {
        let (context, _) = context();
        let record = context.record();
        let events = record.subscribe();

        record.set("name", json!("a")).unwrap();
        record.set("name", json!("a")).unwrap();
        record.set("brand_new", json!(1)).unwrap();

        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![Event::Change {
                attribute: "name".into(),
                previous: json!(""),
                value: json!("a"),
            }]
        );
    }

    #[test]
    fn mutate_on_change_applies_the_chain() {
        let transport = std::sync::Arc::new(MockTransport::new());
        let schema = crate::schema::Schema::builder()
            .attribute("name", json!(""))
            .mutate("name", |value| match value {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other,
            })
            .options(Options::default().with_mutate_on_change(true))
            .build()
            .unwrap();
        let context = Context::new(schema, transport);

        let record = context.record();
        record.set("name", json!("  ada  ")).unwrap();
        assert_eq!(record.get("name"), Some(json!("ada")));
    }

    #[tokio::test]
    async fn save_assigns_identifier_from_scalar_response() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"name": "a"}).as_object().unwrap().clone())
            .unwrap();
        assert!(record.is_new());

        transport.enqueue(Response::new(201).with_body(json!({"id": 5})));
        record.save().await.unwrap();

        assert_eq!(record.identifier(), Some(json!(5)));
        assert!(!record.is_new());
        assert!(record.changed().is_empty());
        assert!(!record.saving());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::Post);
        assert_eq!(sent[0].url, "/api/tasks");
    }

    #[tokio::test]
    async fn invalid_records_never_reach_the_transport() {
        let (context, transport) = context();
        let record = context.record(); // name is "" and fails its rule

        let error = record.save().await.unwrap_err();
        assert!(error.is_validation());
        assert_eq!(transport.calls(), 0);
        assert!(!record.saving());
        assert!(record.has_errors());
    }

    #[tokio::test]
    async fn overlapping_fetches_skip() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();
        transport.enqueue(Response::new(200).with_body(json!({"id": 1, "name": "b"})));

        let (first, second) = tokio::join!(record.fetch(), record.fetch());
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(transport.calls(), 1);
        assert!(first.is_some() != second.is_some());
        assert!(!record.loading());
        assert_eq!(record.get("name"), Some(json!("b")));
    }

    #[tokio::test]
    async fn unchanged_save_is_redundant_when_disallowed() {
        let (context, transport) = context_with(Options::default().with_save_unchanged(false));
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();

        let result = record.save().await.unwrap();
        assert!(result.is_none());
        assert_eq!(transport.calls(), 0);
        assert!(!record.saving());
    }

    #[tokio::test]
    async fn identifier_conflicts_are_rejected_without_override() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();
        record.set("name", json!("b")).unwrap();

        transport.enqueue(Response::new(200).with_body(json!(7)));
        let error = record.save().await.unwrap_err();
        assert!(matches!(error, BindError::IdentifierConflict { .. }));
        assert_eq!(record.identifier(), Some(json!(1)));
    }

    #[tokio::test]
    async fn identifier_overwrite_policy_allows_replacement() {
        let (context, transport) =
            context_with(Options::default().with_overwrite_identifier(true));
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();
        record.set("name", json!("b")).unwrap();

        transport.enqueue(Response::new(200).with_body(json!(7)));
        record.save().await.unwrap();
        assert_eq!(record.identifier(), Some(json!(7)));
    }

    #[tokio::test]
    async fn partial_save_responses_merge_without_erasing() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();
        record.set("name", json!("b")).unwrap();

        transport.enqueue(Response::new(200).with_body(json!({"name": "b!"})));
        record.save().await.unwrap();

        assert_eq!(record.get("name"), Some(json!("b!")));
        assert_eq!(record.get("id"), Some(json!(1)));
        assert!(record.changed().is_empty());
    }

    #[tokio::test]
    async fn server_validation_errors_apply_without_fatal() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();
        record.set("name", json!("b")).unwrap();

        transport.enqueue_failure(
            TransportFailure::new("unprocessable")
                .with_response(Response::new(422).with_body(json!({"name": ["taken"]}))),
        );
        let error = record.save().await.unwrap_err();

        assert!(error.is_validation());
        assert!(!record.fatal());
        assert!(!record.saving());
        assert_eq!(
            record.errors()["name"],
            vec![ErrorEntry::Message("taken".into())]
        );
    }

    #[tokio::test]
    async fn fatal_save_failures_clear_validation_errors() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();
        record.set("name", json!("b")).unwrap();

        transport.enqueue_failure(
            TransportFailure::new("server error").with_response(Response::new(500)),
        );
        let error = record.save().await.unwrap_err();

        assert!(matches!(error, BindError::Transport { .. }));
        assert!(record.fatal());
        assert!(!record.saving());
        assert!(!record.has_errors());
    }

    #[tokio::test]
    async fn fetch_with_no_data_is_a_fatal_response_error() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();

        transport.enqueue(Response::new(200));
        let error = record.fetch().await.unwrap_err();

        assert!(matches!(error, BindError::Response { .. }));
        assert!(record.fatal());
        assert!(!record.loading());
    }

    #[tokio::test]
    async fn delete_clears_state_back_to_defaults() {
        let (context, transport) = context();
        let record = context
            .record_with(json!({"id": 1, "name": "a"}).as_object().unwrap().clone())
            .unwrap();

        transport.enqueue(Response::new(204));
        record.delete().await.unwrap();

        assert_eq!(record.get("id"), Some(json!(null)));
        assert_eq!(record.get("name"), Some(json!("")));
        assert!(record.is_new());
        assert!(!record.deleting());
        assert!(!record.fatal());
    }

    #[tokio::test]
    async fn nested_entities_validate_recursively() {
        let (context, _) = context();
        let parent = context
            .record_with(json!({"id": 1, "name": "parent"}).as_object().unwrap().clone())
            .unwrap();
        let child = context.record(); // empty name fails its rule
        parent.set("child", json!({})).unwrap();
        parent.attach_nested("child", Arc::new(child));

        let errors = parent.validate().await.unwrap();
        let entries = &errors["child"];
        assert!(matches!(entries[0], ErrorEntry::Nested(_)));
    }

    #[test]
    fn the_binding_hook_sees_every_write() {
        use crate::observe::testing::RecordingObserver;

        let (context, _) = context();
        let record = context.record();
        let observer = Arc::new(RecordingObserver::default());
        record.observe(observer.clone());

        record.set("name", json!("a")).unwrap();
        record.sync();
        record.reset();

        let writes = observer.writes.lock();
        assert!(writes.contains(&crate::observe::WriteTarget::Active));
        assert!(writes.contains(&crate::observe::WriteTarget::Reference));
        assert!(writes.contains(&crate::observe::WriteTarget::Errors));
    }

    #[tokio::test]
    async fn validating_an_unknown_attribute_is_an_error() {
        let (context, _) = context();
        let record = context.record();
        assert!(matches!(
            record.validate_attribute("missing").await,
            Err(BindError::UnknownAttribute { .. })
        ));
    }
}
