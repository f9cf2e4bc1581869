//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so any library
//! (reqwest, hyper, ureq, ...) can be plugged in; this module adapts it
//! to the [`Transport`] contract with JSON request/response bodies.

use crate::error::BindResult;
use crate::transport::{RequestDescriptor, Response, Transport, TransportFailure};
use async_trait::async_trait;
use serde_json::Value;

/// A raw HTTP response as produced by an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body; empty for no-content responses.
    pub body: String,
}

/// HTTP client abstraction.
///
/// Implement this to provide the actual wire transport. Errors are
/// transport-level failures (connection refused, timeout); a served
/// response with an error status is returned as a response, not an error.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a single HTTP request.
    async fn execute(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpResponse, String>;
}

/// HTTP-based transport: serializes descriptor bodies to JSON, parses
/// JSON response bodies, and maps error statuses to transport failures
/// carrying the parsed response.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn full_url(&self, request: &RequestDescriptor) -> String {
        let mut url = format!("{}{}", self.base_url, request.url);
        if !request.query.is_empty() {
            let query: Vec<String> = request
                .query
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    fn parse_response(raw: HttpResponse) -> Result<Response, TransportFailure> {
        let mut response = Response::new(raw.status);
        for (name, value) in raw.headers {
            response = response.with_header(name, value);
        }
        if !raw.body.trim().is_empty() {
            let data: Value = serde_json::from_str(&raw.body)
                .map_err(|e| TransportFailure::new(format!("invalid JSON body: {e}")))?;
            response = response.with_body(data);
        }
        Ok(response)
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn send(&self, request: &RequestDescriptor) -> Result<Response, TransportFailure> {
        let url = self.full_url(request);
        let body = match &request.body {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| TransportFailure::new(format!("failed to encode body: {e}")))?,
            ),
            None => None,
        };

        let raw = self
            .client
            .execute(request.method.as_str(), &url, &request.headers, body)
            .await
            .map_err(TransportFailure::new)?;

        let response = Self::parse_response(raw)?;
        if response.status() >= 400 {
            return Err(
                TransportFailure::new(format!("server returned {}", response.status()))
                    .with_response(response),
            );
        }
        Ok(response)
    }
}

/// A loopback client routing requests directly to an in-process handler.
///
/// Useful for end-to-end tests without network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client over the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

/// In-process handler for loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles one request, returning status and body.
    fn handle(&self, method: &str, url: &str, body: Option<&str>) -> BindResult<(u16, String)>;
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn execute(
        &self,
        method: &str,
        url: &str,
        _headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpResponse, String> {
        let (status, body) = self
            .server
            .handle(method, url, body.as_deref())
            .map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            headers: Vec::new(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Method;
    use serde_json::json;

    struct EchoServer;

    impl LoopbackServer for EchoServer {
        fn handle(&self, method: &str, url: &str, body: Option<&str>) -> BindResult<(u16, String)> {
            match (method, url) {
                ("GET", "/api/tasks/1") => Ok((200, r#"{"id": 1, "name": "a"}"#.to_string())),
                ("GET", "/api/tasks?page=2") => Ok((200, "[]".to_string())),
                ("POST", "/api/tasks") => Ok((201, body.unwrap_or("null").to_string())),
                ("DELETE", _) => Ok((204, String::new())),
                _ => Ok((404, r#"{"message": "not found"}"#.to_string())),
            }
        }
    }

    fn transport() -> HttpTransport<LoopbackClient<EchoServer>> {
        HttpTransport::new("", LoopbackClient::new(EchoServer))
    }

    #[tokio::test]
    async fn parses_json_bodies() {
        let request = RequestDescriptor::new(Method::Get, "/api/tasks/1");
        let response = transport().send(&request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.data(), Some(&json!({"id": 1, "name": "a"})));
    }

    #[tokio::test]
    async fn appends_query_parameters() {
        let request = RequestDescriptor::new(Method::Get, "/api/tasks").with_query("page", "2");
        let response = transport().send(&request).await.unwrap();
        assert_eq!(response.data(), Some(&json!([])));
    }

    #[tokio::test]
    async fn round_trips_request_bodies() {
        let request =
            RequestDescriptor::new(Method::Post, "/api/tasks").with_body(json!({"name": "a"}));
        let response = transport().send(&request).await.unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.data(), Some(&json!({"name": "a"})));
    }

    #[tokio::test]
    async fn empty_bodies_are_no_content() {
        let request = RequestDescriptor::new(Method::Delete, "/api/tasks/1");
        let response = transport().send(&request).await.unwrap();
        assert_eq!(response.status(), 204);
        assert!(response.data().is_none());
    }

    #[tokio::test]
    async fn error_statuses_become_failures_with_response() {
        let request = RequestDescriptor::new(Method::Get, "/missing");
        let failure = transport().send(&request).await.unwrap_err();
        assert_eq!(failure.status(), Some(404));
        assert!(failure.response.unwrap().data().is_some());
    }
}
