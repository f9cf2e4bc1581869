//! The request-lifecycle protocol shared by records and aggregates.
//!
//! Every fetch/save/delete follows the same shape: a preflight hook
//! decides whether the request happens at all, the descriptor is built
//! only after preflight (so it observes state preflight just set), and
//! exactly one of the success/failure handlers runs when a request was
//! actually sent.

use crate::error::BindResult;
use crate::transport::{RequestDescriptor, Response, Transport};
use std::future::Future;
use tracing::debug;

/// The three operations governed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Load state from the server.
    Fetch,
    /// Persist state to the server.
    Save,
    /// Remove the entity from the server.
    Delete,
}

impl Operation {
    /// Returns the operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Fetch => "fetch",
            Operation::Save => "save",
            Operation::Delete => "delete",
        }
    }
}

/// The preflight hook's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preflight {
    /// Build and send the request.
    Continue,
    /// Abort silently: no handler runs, the caller observes a no-op.
    /// Used as the guard against overlapping calls of the same kind.
    Skip,
    /// Abort but treat as a successful no-op: the success handler runs
    /// with no response. Used when there is nothing to send.
    Redundant,
}

/// Runs one request through the shared protocol.
///
/// - `preflight` may reject (its error propagates untouched), skip, or
///   declare the request redundant.
/// - `build` runs only on [`Preflight::Continue`], after preflight's
///   state writes are visible.
/// - `on_success` receives `Some(response)` for a real response and
///   `None` for the redundant no-op; its error rejects the call.
/// - `on_failure` maps a transport failure to the error the caller sees;
///   whatever it returns, the call still rejects.
pub(crate) async fn execute<P, B, S, F>(
    operation: Operation,
    transport: &dyn Transport,
    preflight: P,
    build: B,
    on_success: S,
    on_failure: F,
) -> BindResult<Option<Response>>
where
    P: Future<Output = BindResult<Preflight>>,
    B: FnOnce() -> BindResult<RequestDescriptor>,
    S: FnOnce(Option<&Response>) -> BindResult<()>,
    F: FnOnce(&crate::transport::TransportFailure) -> crate::error::BindError,
{
    match preflight.await? {
        Preflight::Skip => {
            debug!(operation = operation.as_str(), "request skipped");
            return Ok(None);
        }
        Preflight::Redundant => {
            debug!(operation = operation.as_str(), "request redundant");
            on_success(None)?;
            return Ok(None);
        }
        Preflight::Continue => {}
    }

    let request = build()?;
    debug!(
        operation = operation.as_str(),
        method = request.method.as_str(),
        url = %request.url,
        "sending request"
    );

    match transport.send(&request).await {
        Ok(response) => {
            debug!(
                operation = operation.as_str(),
                status = response.status(),
                "request succeeded"
            );
            on_success(Some(&response))?;
            Ok(Some(response))
        }
        Err(failure) => {
            debug!(
                operation = operation.as_str(),
                status = failure.status(),
                message = %failure.message,
                "request failed"
            );
            Err(on_failure(&failure))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindError;
    use crate::options::Method;
    use crate::transport::{MockTransport, TransportFailure};
    use serde_json::json;
    use std::cell::Cell;

    fn request() -> BindResult<RequestDescriptor> {
        Ok(RequestDescriptor::new(Method::Get, "/x"))
    }

    #[tokio::test]
    async fn skip_runs_no_handler_and_sends_nothing() {
        let transport = MockTransport::new();
        let success_ran = Cell::new(false);

        let result = execute(
            Operation::Fetch,
            &transport,
            async { Ok(Preflight::Skip) },
            request,
            |_| {
                success_ran.set(true);
                Ok(())
            },
            |failure| failure.into_error(),
        )
        .await
        .unwrap();

        assert!(result.is_none());
        assert!(!success_ran.get());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn redundant_invokes_success_with_no_response() {
        let transport = MockTransport::new();
        let saw = Cell::new(false);

        execute(
            Operation::Save,
            &transport,
            async { Ok(Preflight::Redundant) },
            request,
            |response| {
                saw.set(response.is_none());
                Ok(())
            },
            |failure| failure.into_error(),
        )
        .await
        .unwrap();

        assert!(saw.get());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn continue_sends_and_resolves_with_response() {
        let transport = MockTransport::new();
        transport.enqueue(Response::new(200).with_body(json!({"ok": true})));

        let result = execute(
            Operation::Fetch,
            &transport,
            async { Ok(Preflight::Continue) },
            request,
            |response| {
                assert!(response.is_some());
                Ok(())
            },
            |failure| failure.into_error(),
        )
        .await
        .unwrap();

        assert_eq!(result.unwrap().status(), 200);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn failure_handler_maps_the_rejection() {
        let transport = MockTransport::new();
        transport.enqueue_failure(TransportFailure::new("offline"));

        let error = execute(
            Operation::Delete,
            &transport,
            async { Ok(Preflight::Continue) },
            request,
            |_| Ok(()),
            |_| BindError::response("mapped"),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, BindError::Response { .. }));
    }

    #[tokio::test]
    async fn success_handler_error_rejects() {
        let transport = MockTransport::new();
        transport.enqueue(Response::new(204));

        let error = execute(
            Operation::Fetch,
            &transport,
            async { Ok(Preflight::Continue) },
            request,
            |_| Err(BindError::response("no data")),
            |failure| failure.into_error(),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, BindError::Response { .. }));
    }

    #[tokio::test]
    async fn preflight_error_propagates_before_build() {
        let transport = MockTransport::new();

        let error = execute(
            Operation::Save,
            &transport,
            async { Err(BindError::invalid_operation("nope")) },
            || unreachable!("build must not run"),
            |_: Option<&Response>| Ok(()),
            |failure| failure.into_error(),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, BindError::InvalidOperation { .. }));
        assert_eq!(transport.calls(), 0);
    }
}
