//! # recbind core
//!
//! A client-side active-record layer: observable in-memory records bound
//! to a remote REST-like API through a pluggable transport.
//!
//! This crate provides:
//! - Records with dual active/reference attribute state and deep-equality
//!   dirty tracking
//! - Per-attribute mutation chains, compiled once from declarations
//! - Concurrent asynchronous validation with nested-entity support
//! - A shared request-lifecycle protocol (continue/skip/redundant) for
//!   fetch, save, and delete
//! - Aggregates: ordered, deduplicated record sets with bulk
//!   orchestration and pagination cursors
//! - Transport and HTTP-client abstractions with a scripted mock
//!
//! ## Key invariants
//!
//! - Active and reference state never share a mutable sub-object
//! - Deep comparison of the two is the sole authority for dirty tracking
//! - Within one record or aggregate, only one operation of a kind is in
//!   flight at a time; overlapping calls settle as silent no-ops
//! - Exactly one record instance exists per logical entity, shared by
//!   handle across every containing aggregate

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregate;
mod error;
mod events;
mod http;
mod lifecycle;
mod mutation;
mod observe;
mod options;
mod record;
mod routes;
mod schema;
mod store;
mod transport;
mod uid;
mod validation;
mod value;

pub use aggregate::Aggregate;
pub use error::{BindError, BindResult};
pub use events::{Event, EventFeed};
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer};
pub use lifecycle::{Operation, Preflight};
pub use mutation::{mutator, MutationPipeline, Mutator};
pub use observe::{WriteObserver, WriteTarget};
pub use options::{Method, Methods, Options};
pub use record::Record;
pub use routes::{interpolate, RouteSet, DEFAULT_PARAMETER_PATTERN};
pub use schema::{Context, Schema, SchemaBuilder};
pub use store::RESERVED_NAMES;
pub use transport::{
    MockTransport, RequestDescriptor, Response, Transport, TransportFailure,
};
pub use uid::{RandomUids, SequentialUids, Uid, UidSource};
pub use validation::{
    async_rule, rule, AttributeErrors, ErrorEntry, ErrorMap, Rule, RuleOutcome, RuleSet, Validates,
};
