//! Ordered, deduplicated record sets with bulk orchestration.
//!
//! An aggregate owns positional storage: members are kept in insertion
//! order — significant for bulk save/delete response mapping — keyed by
//! record uid, which makes membership checks O(1) and keeps the
//! order/registry bijection by construction. Records hold only non-owning
//! back-references for deregistration; membership never extends an
//! aggregate's lifetime.

use crate::error::{BindError, BindResult};
use crate::events::{Event, EventFeed};
use crate::lifecycle::{execute, Operation, Preflight};
use crate::observe::{WriteObserver, WriteTarget};
use crate::routes;
use crate::schema::{Context, Schema};
use crate::transport::{RequestDescriptor, Response, TransportFailure};
use crate::uid::Uid;
use crate::validation::{error_map_from_value, keep_first_errors, ErrorEntry, ErrorMap, Validates};
use crate::record::Record;
use async_trait::async_trait;
use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Page marker meaning "last page reached, no further fetch".
const LAST_PAGE: u32 = 0;

pub(crate) struct AggregateInner {
    uid: Uid,
    context: Context,
    state: RwLock<AggregateState>,
    observer: RwLock<Option<Arc<dyn WriteObserver>>>,
    events: EventFeed,
}

struct AggregateState {
    members: IndexMap<Uid, Record>,
    page: Option<u32>,
    loading: bool,
    saving: bool,
    deleting: bool,
    fatal: bool,
    /// Members in flight for the current bulk save, with their pre-save
    /// newness, in iteration order. Response arrays map 1:1 onto this.
    saving_members: Vec<(Record, bool)>,
    /// Members in flight for the current bulk delete.
    deleting_members: Vec<Record>,
}

impl AggregateInner {
    fn notify(&self, target: WriteTarget) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_write(target);
        }
    }

    /// Adds the record unless its uid is already a member. Returns true
    /// when the record was actually added.
    pub(crate) fn ensure_member(inner: &Arc<Self>, record: &Record) -> bool {
        let added = {
            let mut state = inner.state.write();
            if state.members.contains_key(&record.uid()) {
                false
            } else {
                state.members.insert(record.uid(), record.clone());
                state.loading = false;
                true
            }
        };
        if added {
            record.register_aggregate(inner.uid, Arc::downgrade(inner));
            inner.notify(WriteTarget::State);
            inner.events.emit(Event::Add { uid: record.uid() });
        }
        added
    }

    /// Removes the record if present, deregistering the back-reference.
    pub(crate) fn remove_record(inner: &Arc<Self>, record: &Record) -> Option<Record> {
        let removed = inner.state.write().members.shift_remove(&record.uid());
        removed.map(|removed| {
            removed.deregister_aggregate(inner.uid);
            inner.notify(WriteTarget::State);
            inner.events.emit(Event::Remove {
                uid: removed.uid(),
            });
            removed
        })
    }
}

/// An ordered, deduplicated set of records with bulk fetch/save/delete
/// orchestration and a pagination cursor.
#[derive(Clone)]
pub struct Aggregate {
    inner: Arc<AggregateInner>,
}

impl Aggregate {
    pub(crate) fn new(context: Context) -> Self {
        Self {
            inner: Arc::new(AggregateInner {
                uid: context.next_uid(),
                context,
                state: RwLock::new(AggregateState {
                    members: IndexMap::new(),
                    page: None,
                    loading: false,
                    saving: false,
                    deleting: false,
                    fatal: false,
                    saving_members: Vec::new(),
                    deleting_members: Vec::new(),
                }),
                observer: RwLock::new(None),
                events: EventFeed::new(),
            }),
        }
    }

    /// The process-unique identity token.
    pub fn uid(&self) -> Uid {
        self.inner.uid
    }

    fn schema(&self) -> &Schema {
        self.inner.context.schema()
    }

    /// Subscribes to this aggregate's events.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Installs the reactive-binding observer.
    pub fn observe(&self, observer: Arc<dyn WriteObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    fn notify(&self, target: WriteTarget) {
        self.inner.notify(target);
    }

    fn emit(&self, event: Event) {
        self.inner.events.emit(event);
    }

    // ---- membership ------------------------------------------------------

    /// Adds a record. A record whose uid is already a member is a silent
    /// no-op — the sole duplicate-prevention mechanism, O(1) by registry.
    /// Returns true when the record was actually added.
    pub fn add(&self, record: &Record) -> bool {
        AggregateInner::ensure_member(&self.inner, record)
    }

    /// Materializes plain data into a record of this aggregate's type and
    /// adds it.
    pub fn add_data(&self, data: &Value) -> BindResult<Record> {
        let record = self.inner.context.materialize(data)?;
        self.add(&record);
        Ok(record)
    }

    /// Adds every record in the list, filtering out no-ops. Returns the
    /// number actually added.
    pub fn add_all<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> usize {
        records.into_iter().filter(|record| self.add(record)).count()
    }

    /// Removes a record. Removing a non-member is a no-op returning
    /// nothing.
    pub fn remove(&self, record: &Record) -> Option<Record> {
        AggregateInner::remove_record(&self.inner, record)
    }

    /// Removes every record in the list, skipping non-members. Returns
    /// the records actually removed.
    pub fn remove_all<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter_map(|record| self.remove(record))
            .collect()
    }

    /// Removes every member matching the predicate, returning the
    /// removed records.
    pub fn remove_where(&self, predicate: impl Fn(&Record) -> bool) -> Vec<Record> {
        let matches: Vec<Record> = {
            let state = self.inner.state.read();
            state
                .members
                .values()
                .filter(|record| predicate(record))
                .cloned()
                .collect()
        };
        matches
            .iter()
            .filter_map(|record| self.remove(record))
            .collect()
    }

    /// Removes every member whose attributes contain all of the given
    /// key/value pairs (deep equality per key).
    pub fn remove_matching(&self, pattern: &Map<String, Value>) -> Vec<Record> {
        self.remove_where(|record| {
            pattern
                .iter()
                .all(|(name, value)| record.get(name).as_ref() == Some(value))
        })
    }

    /// Removes every member.
    pub fn clear(&self) {
        let removed: Vec<Record> = {
            let mut state = self.inner.state.write();
            state.members.drain(..).map(|(_, record)| record).collect()
        };
        for record in &removed {
            record.deregister_aggregate(self.inner.uid);
            self.emit(Event::Remove {
                uid: record.uid(),
            });
        }
        self.notify(WriteTarget::State);
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.state.read().members.len()
    }

    /// Returns true when the aggregate has no members.
    pub fn is_empty(&self) -> bool {
        self.inner.state.read().members.is_empty()
    }

    /// Returns true when the record is a member. O(1).
    pub fn has(&self, record: &Record) -> bool {
        self.inner.state.read().members.contains_key(&record.uid())
    }

    /// Member handles in insertion order.
    pub fn members(&self) -> Vec<Record> {
        self.inner.state.read().members.values().cloned().collect()
    }

    /// The member at a position, if any.
    pub fn get(&self, index: usize) -> Option<Record> {
        self.inner
            .state
            .read()
            .members
            .get_index(index)
            .map(|(_, record)| record.clone())
    }

    /// The first member matching the predicate.
    pub fn find(&self, predicate: impl Fn(&Record) -> bool) -> Option<Record> {
        self.inner
            .state
            .read()
            .members
            .values()
            .find(|record| predicate(record))
            .cloned()
    }

    // ---- state flags -----------------------------------------------------

    /// Returns true while a fetch is in flight.
    pub fn loading(&self) -> bool {
        self.inner.state.read().loading
    }

    /// Returns true while a bulk save is in flight.
    pub fn saving(&self) -> bool {
        self.inner.state.read().saving
    }

    /// Returns true while a bulk delete is in flight.
    pub fn deleting(&self) -> bool {
        self.inner.state.read().deleting
    }

    /// Returns true when the last operation failed fatally.
    pub fn fatal(&self) -> bool {
        self.inner.state.read().fatal
    }

    // ---- pagination ------------------------------------------------------

    /// Enables pagination at `max(1, n)`, or disables it with `None`.
    pub fn page(&self, page: Option<u32>) {
        self.inner.state.write().page = page.map(|n| n.max(1));
        self.notify(WriteTarget::State);
    }

    /// The current page marker.
    pub fn current_page(&self) -> Option<u32> {
        self.inner.state.read().page
    }

    /// Returns true when a paginated fetch has exhausted the server.
    pub fn is_last_page(&self) -> bool {
        self.inner.state.read().page == Some(LAST_PAGE)
    }

    // ---- validation ------------------------------------------------------

    /// Validates every member concurrently, resolving with a map keyed by
    /// member position containing only the members that produced errors.
    pub async fn validate(&self) -> BindResult<ErrorMap> {
        let members = self.members();
        let results = join_all(members.iter().map(Record::validate)).await;
        let mut map = ErrorMap::new();
        for (index, result) in results.into_iter().enumerate() {
            let errors = result?;
            if !errors.is_empty() {
                map.insert(index.to_string(), vec![ErrorEntry::Nested(errors)]);
            }
        }
        Ok(map)
    }

    // ---- request lifecycle -----------------------------------------------

    /// Fetches members from the server.
    ///
    /// Without pagination the member set is replaced wholesale; with
    /// pagination the returned models are appended and the page advances,
    /// and fetching past the last page is a redundant no-op.
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
                    if state.page == Some(LAST_PAGE) {
                        return Ok(Preflight::Redundant);
                    }
                    state.loading = true;
                }
                self.notify(WriteTarget::State);
                Ok(Preflight::Continue)
            },
            || self.build_fetch_request(),
            |response| self.handle_fetch_success(response),
            |failure| self.handle_fetch_failure(failure),
        )
        .await
    }

    /// Saves members that are new or changed (every member when
    /// `save_unchanged` is on) as one bulk request.
    pub async fn save(&self) -> BindResult<Option<Response>> {
        execute(
            Operation::Save,
            self.inner.context.transport(),
            self.save_preflight(),
            || self.build_save_request(),
            |response| self.handle_save_success(response),
            |failure| self.handle_save_failure(failure),
        )
        .await
    }

    /// Deletes every member that has an identifier as one bulk request.
    pub async fn delete(&self) -> BindResult<Option<Response>> {
        execute(
            Operation::Delete,
            self.inner.context.transport(),
            async {
                let targets: Vec<Record> = {
                    let mut state = self.inner.state.write();
                    if state.deleting {
                        return Ok(Preflight::Skip);
                    }
                    let targets: Vec<Record> = state
                        .members
                        .values()
                        .filter(|record| record.identifier().is_some())
                        .cloned()
                        .collect();
                    if targets.is_empty() {
                        return Ok(Preflight::Redundant);
                    }
                    state.deleting = true;
                    state.deleting_members = targets.clone();
                    targets
                };
                self.notify(WriteTarget::State);
                for record in &targets {
                    record.begin_delete();
                }
                Ok(Preflight::Continue)
            },
            || self.build_delete_request(),
            |_response| {
                self.handle_delete_success();
                Ok(())
            },
            |failure| self.handle_delete_failure(failure),
        )
        .await
    }

    async fn save_preflight(&self) -> BindResult<Preflight> {
        let targets: Vec<(Record, bool)> = {
            let mut state = self.inner.state.write();
            if state.saving {
                return Ok(Preflight::Skip);
            }
            let save_unchanged = self.schema().options().save_unchanged;
            let targets: Vec<(Record, bool)> = state
                .members
                .values()
                .filter(|record| {
                    save_unchanged || record.is_new() || !record.changed().is_empty()
                })
                .map(|record| (record.clone(), record.is_new()))
                .collect();
            if targets.is_empty() {
                return Ok(Preflight::Redundant);
            }
            state.saving = true;
            state.saving_members = targets.clone();
            targets
        };
        self.notify(WriteTarget::State);
        for (record, _) in &targets {
            record.begin_save();
        }

        let results = join_all(targets.iter().map(|(record, _)| record.validate())).await;
        let mut failed = ErrorMap::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(errors) if errors.is_empty() => {}
                Ok(errors) => {
                    failed.insert(index.to_string(), vec![ErrorEntry::Nested(errors)]);
                }
                Err(error) => {
                    self.abort_save(&targets);
                    return Err(error);
                }
            }
        }
        if !failed.is_empty() {
            self.abort_save(&targets);
            return Err(BindError::validation(failed));
        }
        Ok(Preflight::Continue)
    }

    fn abort_save(&self, targets: &[(Record, bool)]) {
        for (record, _) in targets {
            record.end_save_flag();
        }
        {
            let mut state = self.inner.state.write();
            state.saving = false;
            state.saving_members.clear();
        }
        self.notify(WriteTarget::State);
    }

    fn build_fetch_request(&self) -> BindResult<RequestDescriptor> {
        let schema = self.schema();
        let template = schema.aggregate_routes().template(Operation::Fetch)?;
        let url = routes::interpolate(
            template,
            &Map::new(),
            &schema.options().route_parameter_pattern,
        )?;
        let mut request = RequestDescriptor::new(schema.options().methods.fetch, url);
        if let Some(page) = self.inner.state.read().page {
            request = request.with_query("page", page.to_string());
        }
        Ok(request)
    }

    fn build_save_request(&self) -> BindResult<RequestDescriptor> {
        let schema = self.schema();
        let template = schema.aggregate_routes().template(Operation::Save)?;
        let url = routes::interpolate(
            template,
            &Map::new(),
            &schema.options().route_parameter_pattern,
        )?;
        let body: Vec<Value> = self
            .inner
            .state
            .read()
            .saving_members
            .iter()
            .map(|(record, was_new)| record.save_body(*was_new))
            .collect();
        Ok(RequestDescriptor::new(schema.options().methods.save, url).with_body(Value::Array(body)))
    }

    fn build_delete_request(&self) -> BindResult<RequestDescriptor> {
        let schema = self.schema();
        let options = schema.options();
        let template = schema.aggregate_routes().template(Operation::Delete)?;
        let url = routes::interpolate(template, &Map::new(), &options.route_parameter_pattern)?;

        let identifiers: Vec<Value> = self
            .inner
            .state
            .read()
            .deleting_members
            .iter()
            .filter_map(Record::identifier)
            .collect();

        let mut request = RequestDescriptor::new(options.methods.delete, url);
        if options.use_delete_body {
            request = request.with_body(Value::Array(identifiers));
        } else {
            let joined: Vec<String> = identifiers.iter().map(routes::stringify).collect();
            request = request.with_query(options.identifier.clone(), joined.join(","));
        }
        Ok(request)
    }

    fn handle_fetch_success(&self, response: Option<&Response>) -> BindResult<()> {
        let Some(response) = response else {
            // Redundant fetch on the last page: nothing to reconcile.
            self.emit(Event::Fetch { error: None });
            return Ok(());
        };

        let items = match response.data() {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(self.fail_fetch(BindError::response(format!(
                    "fetch response data must be an array, got {other}"
                ))))
            }
            None => {
                return Err(
                    self.fail_fetch(BindError::response("response contained no data"))
                )
            }
        };

        // Materialize everything before mutating membership, so a bad
        // element leaves the member set untouched.
        let mut records = Vec::with_capacity(items.len());
        for item in &items {
            match self.inner.context.materialize(item) {
                Ok(record) => records.push(record),
                Err(error) => return Err(self.fail_fetch(error)),
            }
        }

        let page = self.inner.state.read().page;
        match page {
            Some(current) => {
                if records.is_empty() {
                    self.inner.state.write().page = Some(LAST_PAGE);
                } else {
                    for record in &records {
                        self.add(record);
                    }
                    self.inner.state.write().page = Some(current + 1);
                }
            }
            None => {
                self.clear();
                for record in &records {
                    self.add(record);
                }
            }
        }

        {
            let mut state = self.inner.state.write();
            state.loading = false;
            state.fatal = false;
        }
        self.notify(WriteTarget::State);
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

    fn handle_save_success(&self, response: Option<&Response>) -> BindResult<()> {
        let targets = self.inner.state.read().saving_members.clone();

        match response.and_then(Response::data) {
            None | Some(Value::Null) => {
                // No model data: every saving member is synced as-is.
                for (record, was_new) in &targets {
                    if let Err(error) = record.apply_save_success(None, *was_new) {
                        return Err(self.fail_bulk_save(error, &targets));
                    }
                }
            }
            Some(Value::Array(items)) => {
                if items.len() != targets.len() {
                    warn!(
                        expected = targets.len(),
                        got = items.len(),
                        "bulk save response length mismatch"
                    );
                    return Err(self.fail_bulk_save(
                        BindError::response(format!(
                            "bulk save response carried {} models for {} saving records",
                            items.len(),
                            targets.len()
                        )),
                        &targets,
                    ));
                }
                for ((record, was_new), item) in targets.iter().zip(items) {
                    if let Err(error) = record.apply_save_success(Some(item), *was_new) {
                        return Err(self.fail_bulk_save(error, &targets));
                    }
                }
            }
            Some(other) => {
                return Err(self.fail_bulk_save(
                    BindError::response(format!(
                        "bulk save response must be an array, got {other}"
                    )),
                    &targets,
                ))
            }
        }

        {
            let mut state = self.inner.state.write();
            state.saving = false;
            state.fatal = false;
            state.saving_members.clear();
        }
        self.notify(WriteTarget::State);
        self.emit(Event::Save { error: None });
        Ok(())
    }

    /// Response-shape failure during bulk save: members keep their data
    /// and dirty state untouched; only in-flight flags are released.
    fn fail_bulk_save(&self, error: BindError, targets: &[(Record, bool)]) -> BindError {
        for (record, _) in targets {
            record.end_save_flag();
        }
        {
            let mut state = self.inner.state.write();
            state.saving = false;
            state.fatal = true;
            state.saving_members.clear();
        }
        self.notify(WriteTarget::State);
        self.emit(Event::Save {
            error: Some(error.to_string()),
        });
        error
    }

    fn handle_save_failure(&self, failure: &TransportFailure) -> BindError {
        let targets = self.inner.state.read().saving_members.clone();
        let options = self.schema().options();

        if failure.status() == Some(options.validation_error_status) {
            match self.reconcile_validation_errors(&targets, failure) {
                Ok(aggregated) => {
                    {
                        let mut state = self.inner.state.write();
                        state.saving = false;
                        state.saving_members.clear();
                    }
                    self.notify(WriteTarget::State);
                    self.emit(Event::Save {
                        error: Some("validation failed".to_string()),
                    });
                    BindError::validation(aggregated)
                }
                Err(shape_error) => self.fail_bulk_save(shape_error, &targets),
            }
        } else {
            for (record, _) in &targets {
                record.apply_fatal_save_failure(failure.into_error());
            }
            {
                let mut state = self.inner.state.write();
                state.saving = false;
                state.fatal = true;
                state.saving_members.clear();
            }
            self.notify(WriteTarget::State);
            self.emit(Event::Save {
                error: Some(failure.message.clone()),
            });
            failure.into_error()
        }
    }

    /// Distributes server-reported validation errors to saving members.
    ///
    /// Accepts an array (order-correspondent, length must match) or an
    /// object keyed by record identifier (unmatched keys are silently
    /// ignored — the server may report errors for records no longer
    /// present).
    fn reconcile_validation_errors(
        &self,
        targets: &[(Record, bool)],
        failure: &TransportFailure,
    ) -> BindResult<ErrorMap> {
        let payload = failure
            .response
            .as_ref()
            .and_then(Response::validation_errors)
            .ok_or_else(|| BindError::response("validation failure carried no payload"))?;

        let mut aggregated = ErrorMap::new();
        match payload {
            Value::Array(items) => {
                if items.len() != targets.len() {
                    return Err(BindError::response(format!(
                        "bulk validation payload carried {} entries for {} saving records",
                        items.len(),
                        targets.len()
                    )));
                }
                for (index, ((record, _), item)) in targets.iter().zip(items).enumerate() {
                    let errors = error_map_from_value(item)?;
                    self.distribute_member_errors(record, index, errors, &mut aggregated);
                }
            }
            Value::Object(by_identifier) => {
                for (index, (record, _)) in targets.iter().enumerate() {
                    let payload = record
                        .identifier()
                        .map(|identifier| routes::stringify(&identifier))
                        .and_then(|key| by_identifier.get(&key));
                    match payload {
                        Some(value) => {
                            let errors = error_map_from_value(value)?;
                            self.distribute_member_errors(record, index, errors, &mut aggregated);
                        }
                        None => record.end_save_flag(),
                    }
                }
            }
            other => {
                return Err(BindError::response(format!(
                    "bulk validation payload must be an array or object, got {other}"
                )))
            }
        }
        Ok(aggregated)
    }

    fn distribute_member_errors(
        &self,
        record: &Record,
        index: usize,
        mut errors: ErrorMap,
        aggregated: &mut ErrorMap,
    ) {
        if self.schema().options().use_first_error_only {
            keep_first_errors(&mut errors);
        }
        if errors.is_empty() {
            record.end_save_flag();
        } else {
            record.apply_response_errors(errors.clone());
            aggregated.insert(index.to_string(), vec![ErrorEntry::Nested(errors)]);
        }
    }

    fn handle_delete_success(&self) {
        let targets = {
            let mut state = self.inner.state.write();
            state.deleting = false;
            state.fatal = false;
            std::mem::take(&mut state.deleting_members)
        };
        for record in &targets {
            record.apply_delete_success();
        }
        self.notify(WriteTarget::State);
        self.emit(Event::Delete { error: None });
    }

    fn handle_delete_failure(&self, failure: &TransportFailure) -> BindError {
        let targets = {
            let mut state = self.inner.state.write();
            state.deleting = false;
            state.fatal = true;
            std::mem::take(&mut state.deleting_members)
        };
        for record in &targets {
            record.apply_fatal_delete_failure(failure.into_error());
        }
        self.notify(WriteTarget::State);
        self.emit(Event::Delete {
            error: Some(failure.message.clone()),
        });
        failure.into_error()
    }
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Aggregate")
            .field("uid", &self.inner.uid)
            .field("members", &state.members.len())
            .field("page", &state.page)
            .field("loading", &state.loading)
            .field("saving", &state.saving)
            .field("deleting", &state.deleting)
            .field("fatal", &state.fatal)
            .finish()
    }
}

#[async_trait]
impl Validates for Aggregate {
    async fn validation_errors(&self) -> BindResult<ErrorMap> {
        self.validate().await
    }
}
