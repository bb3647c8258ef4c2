//! Error types for transports, connectors and tool execution.
//!
//! Two layers:
//!
//! - [`TransportError`]: byte-channel failures (spawn, I/O, HTTP, framing).
//! - [`ConnectorError`]: the connector-facing taxonomy. Every failed
//!   [`ToolResult`](crate::connector::ToolResult) carries its [`ErrorKind`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by a [`Transport`](crate::mcp::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The executable could not be started.
    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    /// The process started but was gone before the grace period elapsed.
    #[error("`{command}` exited immediately ({status})")]
    ExitedEarly { command: String, status: String },

    /// The remote endpoint rejected our credentials.
    #[error("unauthorized ({status}): {url}")]
    Unauthorized { url: String, status: u16 },

    /// The remote endpoint answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// Network-level failure (DNS, refused connection, reset).
    #[error("network error: {0}")]
    Network(String),

    /// Local I/O failure on a pipe.
    #[error("I/O error: {0}")]
    Io(String),

    /// A single inbound frame exceeded the configured bound.
    #[error("inbound frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// The persistent inbound stream ended underneath us.
    #[error("stream dropped: {0}")]
    StreamDropped(String),

    /// The transport is not connected, or was already disconnected.
    #[error("transport closed")]
    Closed,

    /// `receive` was called twice; the frame stream is not restartable.
    #[error("frame stream already taken")]
    StreamTaken,

    /// The transport could not be built from its configuration.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Operations bounded by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Connect,
    Discover,
    Execute,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Discover => "discover",
            Self::Execute => "execute",
        })
    }
}

/// Connector-level error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Process exited immediately, handshake rejected, network unreachable.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A bounded operation exceeded its limit.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: Operation, after: Duration },

    /// The connector is not in the `connected` state.
    #[error("connector '{0}' is not connected")]
    NotConnected(String),

    /// The requested tool is not present in the catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A required credential is absent or empty.
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    /// The caller cancelled the operation.
    #[error("execution cancelled")]
    Cancelled,

    /// The provider reported a failure; the message is passed through verbatim.
    #[error("{0}")]
    Provider(String),

    /// The provider sent something that does not follow the tool protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid connector configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ConnectorError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::AuthenticationRequired(_) => ErrorKind::AuthenticationRequired,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<TransportError> for ConnectorError {
    fn from(e: TransportError) -> Self {
        match &e {
            TransportError::Unauthorized { .. } => Self::AuthenticationRequired(e.to_string()),
            TransportError::InvalidConfig(msg) => Self::Config(msg.clone()),
            _ => Self::Connection(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Flat, copyable classification of a [`ConnectorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    NotConnected,
    ToolNotFound,
    AuthenticationRequired,
    Cancelled,
    Provider,
    Protocol,
    Config,
}

impl ErrorKind {
    /// Whether a higher layer may retry (with backoff). Only timeouts qualify:
    /// cancellations are never retried and provider failures are final.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_maps_to_authentication_required() {
        let err: ConnectorError = TransportError::Unauthorized {
            url: "https://example.test/mcp".into(),
            status: 401,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::AuthenticationRequired);
    }

    #[test]
    fn test_transport_errors_map_to_connection() {
        let err: ConnectorError = TransportError::ExitedEarly {
            command: "server".into(),
            status: "exit status: 1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().contains("exited immediately"));
    }

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Provider.is_retryable());
    }

    #[test]
    fn test_timeout_message() {
        let err = ConnectorError::Timeout {
            operation: Operation::Execute,
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "execute timed out after 1500ms");
    }

    #[test]
    fn test_provider_message_is_verbatim() {
        let err = ConnectorError::Provider("rate limited by upstream".into());
        assert_eq!(err.to_string(), "rate limited by upstream");
    }
}
