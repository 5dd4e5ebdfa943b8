//! Error types shared by transports, managers, the dispatcher and the
//! streaming aggregator.

use std::time::Duration;

use thiserror::Error;

/// Crate error type.
#[derive(Error, Debug)]
pub enum Error {
    /// No live transport; a reconnect has been scheduled.
    #[error("endpoint '{endpoint}' not connected, connection attempt triggered")]
    NotConnected {
        /// Endpoint name.
        endpoint: String,
    },

    /// The transport failed in a way that means the connection is gone.
    #[error("endpoint '{endpoint}' connection error: {reason}")]
    Connection {
        /// Endpoint name.
        endpoint: String,
        /// What went wrong on the wire.
        reason: String,
    },

    /// The dispatch request could not be parsed.
    #[error("invalid arguments JSON: {0}")]
    InvalidArguments(String),

    /// A required dispatch field was empty or absent.
    #[error("'{0}' field in tool arguments is required")]
    MissingField(&'static str),

    /// No endpoint is registered under this name.
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    /// The remote call failed; the cause is kept as the source.
    #[error("call to '{endpoint}' operation '{operation}' failed: {source}")]
    Invocation {
        /// Endpoint name.
        endpoint: String,
        /// Operation name.
        operation: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// An assembled tool call did not carry a JSON object as arguments.
    #[error("invalid JSON arguments for tool call {call_id}: {reason}")]
    MalformedArguments {
        /// Offending call id.
        call_id: String,
        /// Parser message.
        reason: String,
    },

    /// The endpoint answered with a JSON-RPC error object.
    #[error("endpoint error [{code}]: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional structured data.
        data: Option<serde_json::Value>,
    },

    /// The peer sent something that does not follow the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No answer arrived in time.
    #[error("request '{method}' timed out after {after:?}")]
    Timeout {
        /// JSON-RPC method or operation that timed out.
        method: String,
        /// Effective timeout.
        after: Duration,
    },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The manager or transport has been closed.
    #[error("endpoint '{0}' has been closed")]
    Closed(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The model asked for a tool this relay does not dispatch.
    #[error("unsupported tool: {0}")]
    UnsupportedTool(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::Connection`] for `endpoint`.
    pub fn connection(endpoint: &str, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure means the underlying connection is lost.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Invocation { source, .. } => source.is_connection(),
            _ => false,
        }
    }
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_classification() {
        let err = Error::connection("time", "stdout closed");
        assert!(err.is_connection());
        assert_eq!(
            err.to_string(),
            "endpoint 'time' connection error: stdout closed"
        );

        let wrapped = Error::Invocation {
            endpoint: "time".to_string(),
            operation: "now".to_string(),
            source: Box::new(err),
        };
        assert!(wrapped.is_connection());

        assert!(!Error::Cancelled.is_connection());
        assert!(
            !Error::Timeout {
                method: "tools/call".to_string(),
                after: Duration::from_secs(1),
            }
            .is_connection()
        );
    }

    #[test]
    fn test_missing_field_message() {
        let err = Error::MissingField("resource");
        assert_eq!(
            err.to_string(),
            "'resource' field in tool arguments is required"
        );
    }
}
