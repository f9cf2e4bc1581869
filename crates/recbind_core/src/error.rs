//! Error types for recbind.

use crate::validation::ErrorMap;
use serde_json::Value;
use thiserror::Error;

/// Result type for recbind operations.
pub type BindResult<T> = Result<T, BindError>;

/// Errors that can occur while binding records to a remote API.
#[derive(Debug, Error)]
pub enum BindError {
    /// One or more attributes failed validation. Never sent to the network.
    #[error("validation failed for {} attribute(s)", errors.len())]
    Validation {
        /// Attribute name to error entries.
        errors: ErrorMap,
    },

    /// The server response violated a structural contract this layer
    /// relies on (wrong bulk array length, missing fetch data, malformed
    /// validation payload).
    #[error("response error: {message}")]
    Response {
        /// Description of the contract violation.
        message: String,
    },

    /// The transport failed to complete the request.
    #[error("transport error: {message}")]
    Transport {
        /// Error message from the transport.
        message: String,
        /// HTTP status, when a response was received.
        status: Option<u16>,
    },

    /// Attempt to overwrite an already-set, differing identifier without
    /// the override policy enabled.
    #[error("identifier conflict: cannot overwrite {current} with {incoming}")]
    IdentifierConflict {
        /// The identifier currently set on the record.
        current: Value,
        /// The identifier the response carried.
        incoming: Value,
    },

    /// An attribute name collides with a reserved internal field name.
    #[error("reserved attribute name: {name}")]
    ReservedAttribute {
        /// The offending name.
        name: String,
    },

    /// The attribute does not exist on the record.
    #[error("unknown attribute: {name}")]
    UnknownAttribute {
        /// The attribute that was requested.
        name: String,
    },

    /// A route template could not be resolved.
    #[error("route error: {message}")]
    Route {
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl BindError {
    /// Creates a validation error from an error map.
    pub fn validation(errors: ErrorMap) -> Self {
        Self::Validation { errors }
    }

    /// Creates a response/protocol error.
    pub fn response(message: impl Into<String>) -> Self {
        Self::Response {
            message: message.into(),
        }
    }

    /// Creates a transport error without a status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    /// Creates a route resolution error.
    pub fn route(message: impl Into<String>) -> Self {
        Self::Route {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns the attribute error map for validation errors.
    pub fn validation_errors(&self) -> Option<&ErrorMap> {
        match self {
            Self::Validation { errors } => Some(errors),
            _ => None,
        }
    }

    /// Returns the response status for transport errors, if one was seen.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }
}
