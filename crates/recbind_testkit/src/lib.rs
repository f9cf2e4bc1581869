//! # recbind testkit
//!
//! Shared fixtures for exercising the record layer: a canonical "task"
//! schema, deterministic contexts over the scripted transport, and
//! response builders.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use recbind_core::{
    rule, Context, MockTransport, Options, Response, RouteSet, RuleOutcome, Schema,
    SequentialUids, TransportFailure,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// The canonical test schema: a task with `id`, `name`, and `done`.
///
/// `name` must be non-empty. Routes follow a plain REST layout under
/// `/api/tasks`.
pub fn task_schema() -> Schema {
    task_schema_with(Options::default())
}

/// The task schema with custom options.
pub fn task_schema_with(options: Options) -> Schema {
    Schema::builder()
        .attribute("id", json!(null))
        .attribute("name", json!(""))
        .attribute("done", json!(false))
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
        .aggregate_routes(
            RouteSet::new()
                .with_fetch("/api/tasks")
                .with_save("/api/tasks")
                .with_delete("/api/tasks"),
        )
        .options(options)
        .build()
        .expect("task schema is valid")
}

/// A deterministic context over a scripted transport, returning both so
/// tests can script responses and assert on sent requests.
pub fn task_context() -> (Context, Arc<MockTransport>) {
    context_for(task_schema())
}

/// A deterministic context for an arbitrary schema.
pub fn context_for(schema: Schema) -> (Context, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let context =
        Context::new(schema, Arc::clone(&transport)).with_uid_source(SequentialUids::new());
    (context, transport)
}

/// A 200 response with a JSON body.
pub fn ok(body: Value) -> Response {
    Response::new(200).with_body(body)
}

/// A 201 response with a JSON body.
pub fn created(body: Value) -> Response {
    Response::new(201).with_body(body)
}

/// A 204 response with no body.
pub fn no_content() -> Response {
    Response::new(204)
}

/// A validation failure (status 422) carrying a per-attribute payload.
pub fn validation_failure(payload: Value) -> TransportFailure {
    TransportFailure::new("unprocessable entity")
        .with_response(Response::new(422).with_body(payload))
}

/// A fatal server failure with the given status.
pub fn server_failure(status: u16) -> TransportFailure {
    TransportFailure::new(format!("server returned {status}"))
        .with_response(Response::new(status))
}

/// A connection-level failure with no response at all.
pub fn network_failure() -> TransportFailure {
    TransportFailure::new("connection refused")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_schema_declares_three_attributes() {
        let schema = task_schema();
        assert_eq!(schema.attributes().len(), 3);
        assert!(schema.rules().has("name"));
    }

    #[tokio::test]
    async fn context_is_deterministic() {
        let (context, transport) = task_context();
        let record = context.record();
        assert!(record.is_new());
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn builders_carry_status() {
        assert_eq!(ok(json!({})).status(), 200);
        assert_eq!(no_content().status(), 204);
        assert_eq!(validation_failure(json!({})).status(), Some(422));
        assert_eq!(server_failure(500).status(), Some(500));
        assert!(network_failure().status().is_none());
    }
}
