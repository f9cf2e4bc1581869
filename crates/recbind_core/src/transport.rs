//! Transport layer abstraction.
//!
//! The core never talks to the network itself: it builds a request
//! descriptor and hands it to a [`Transport`]. This trait seam allows
//! different implementations (HTTP via any client library, loopback, mock
//! for testing, etc.).

use crate::error::{BindError, BindResult};
use crate::options::Method;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

/// Everything a transport needs to execute one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// HTTP verb.
    pub method: Method,
    /// Resolved URL (route template already interpolated).
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Query parameters, appended by the transport.
    pub query: Vec<(String, String)>,
    /// JSON body, when the operation carries one.
    pub body: Option<Value>,
}

impl RequestDescriptor {
    /// Creates a descriptor with no headers, query, or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response as seen by the record layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

impl Response {
    /// Creates a response with the given status and no body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the response status.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the response data, when a body was present.
    pub fn data(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Returns the validation-error payload. This is the body; the caller
    /// decides by status whether to read it as errors.
    pub fn validation_errors(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

/// A failed transport call: an error message plus the response, when one
/// was received (validation failures arrive this way).
#[derive(Debug)]
pub struct TransportFailure {
    /// Description of the failure.
    pub message: String,
    /// The response, when the server answered at all.
    pub response: Option<Response>,
}

impl TransportFailure {
    /// Creates a failure with no response.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response: None,
        }
    }

    /// Attaches the response that accompanied the failure.
    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    /// Returns the response status, when a response was received.
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(Response::status)
    }

    /// Converts into the transport error surfaced to callers.
    pub(crate) fn into_error(&self) -> BindError {
        BindError::Transport {
            message: self.message.clone(),
            status: self.status(),
        }
    }
}

/// Executes request descriptors against a remote API.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a single request. There is exactly one logical request per
    /// operation: failures are surfaced, never retried here.
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportFailure>;
}

/// A scripted transport for testing.
///
/// Responses are consumed in FIFO order; every sent descriptor is kept
/// for assertions.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<Response, TransportFailure>>>,
    sent: Mutex<Vec<RequestDescriptor>>,
}

impl MockTransport {
    /// Creates a transport with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a successful response.
    pub fn enqueue(&self, response: Response) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Scripts a failure.
    pub fn enqueue_failure(&self, failure: TransportFailure) {
        self.responses.lock().push_back(Err(failure));
    }

    /// Returns every descriptor sent so far.
    pub fn sent(&self) -> Vec<RequestDescriptor> {
        self.sent.lock().clone()
    }

    /// Returns how many requests were sent.
    pub fn calls(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportFailure> {
        // Yield once so a call made while this one is in flight observes
        // the in-flight flags preflight just set.
        YieldOnce(false).await;
        self.sent.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportFailure::new("no scripted response")))
    }
}

struct YieldOnce(bool);

impl std::future::Future for YieldOnce {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.0 {
            std::task::Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportFailure> {
        (**self).send(request).await
    }
}

/// Convenience: checks a transport result for the no-response case.
pub(crate) fn require_data(response: &Response) -> BindResult<&Value> {
    response
        .data()
        .filter(|data| !data.is_null())
        .ok_or_else(|| BindError::response("response contained no data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_responses_in_order() {
        let transport = MockTransport::new();
        transport.enqueue(Response::new(200).with_body(json!({"id": 1})));
        transport.enqueue_failure(TransportFailure::new("boom"));

        let request = RequestDescriptor::new(Method::Get, "/api/tasks/1");

        let first = transport.send(&request).await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(first.data(), Some(&json!({"id": 1})));

        let second = transport.send(&request).await.unwrap_err();
        assert_eq!(second.message, "boom");

        assert_eq!(transport.calls(), 2);
        assert_eq!(transport.sent()[0].url, "/api/tasks/1");
    }

    #[tokio::test]
    async fn exhausted_script_fails() {
        let transport = MockTransport::new();
        let request = RequestDescriptor::new(Method::Get, "/x");
        assert!(transport.send(&request).await.is_err());
    }

    #[test]
    fn failure_status_comes_from_response() {
        let failure =
            TransportFailure::new("unprocessable").with_response(Response::new(422));
        assert_eq!(failure.status(), Some(422));
        assert_eq!(failure.into_error().status(), Some(422));
    }

    #[test]
    fn descriptor_builder() {
        let request = RequestDescriptor::new(Method::Post, "/api/tasks")
            .with_header("Accept", "application/json")
            .with_query("page", "2")
            .with_body(json!({"name": "a"}));

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.query[0].1, "2");
        assert!(request.body.is_some());
    }
}
