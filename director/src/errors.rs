//! Error types for the supercompose director

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cause attached to a failed connection attempt
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Why a connection to a node could not be established.
///
/// The kind is reported upstream verbatim so operators can tell which node
/// field (host, credentials, key) is wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    Dns,
    Connection,
    Authentication,
    PrivateKeyParse,
    Unknown,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionErrorKind::Dns => "host resolution failed",
            ConnectionErrorKind::Connection => "connection failed",
            ConnectionErrorKind::Authentication => "authentication failed",
            ConnectionErrorKind::PrivateKeyParse => "private key could not be parsed",
            ConnectionErrorKind::Unknown => "unknown connection error",
        };
        f.write_str(s)
    }
}

/// Main error type for the director
#[derive(Error, Debug)]
pub enum DirectorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("{kind}: {message}")]
    ConnectionFailed {
        kind: ConnectionErrorKind,
        message: String,
        #[source]
        source: Option<BoxedCause>,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Node reconciliation failed: {0}")]
    NodeReconciliationFailed(String),

    #[error("Deployment reconciliation failed: {0}")]
    DeploymentReconciliationFailed(String),

    #[error("Container info error: {0}")]
    ContainerInfo(String),

    #[error("Unknown container state: {0}")]
    UnknownContainerState(String),

    #[error("Proxy error ({status}): {title}")]
    Proxy { status: u16, title: String },

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Lease error: {0}")]
    LeaseError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DirectorError {
    /// Build a connection failure without an underlying error value
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        DirectorError::ConnectionFailed {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Build a connection failure that keeps its cause
    pub fn connection_with(
        kind: ConnectionErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxedCause>,
    ) -> Self {
        DirectorError::ConnectionFailed {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Expected shutdown rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DirectorError::Cancelled)
    }

    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            DirectorError::ConnectionFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for DirectorError {
    fn from(err: redis::RedisError) -> Self {
        DirectorError::LeaseError(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for DirectorError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        DirectorError::TokenError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_keeps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DirectorError::connection_with(ConnectionErrorKind::Connection, "ssh to 10.0.0.1:22", cause);
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Connection));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "connection failed: ssh to 10.0.0.1:22");
    }

    #[test]
    fn test_cancelled_is_not_a_failure() {
        assert!(DirectorError::Cancelled.is_cancelled());
        assert!(!DirectorError::Internal("boom".to_string()).is_cancelled());
    }
}
