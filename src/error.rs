// Error handling module
// Defines the client error taxonomy and session invalidation reasons

use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a session could not be recovered
///
/// Cloneable so a single refresh failure can be handed to every request
/// queued behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInvalidReason {
    /// A 401 arrived and no refresh token was stored
    MissingRefreshToken,

    /// The refresh endpoint itself answered 401
    RefreshRejected,

    /// The refresh exchange failed for any other reason
    RefreshFailed(String),

    /// A request replayed with a fresh token was rejected again
    RetryRejected,

    /// The session was cleared by another request while this one was in flight
    SessionCleared,

    /// The caller leading the refresh went away before it settled
    RefreshAbandoned,
}

impl fmt::Display for SessionInvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRefreshToken => write!(f, "no refresh token available"),
            Self::RefreshRejected => write!(f, "refresh token was rejected"),
            Self::RefreshFailed(msg) => write!(f, "token refresh failed: {}", msg),
            Self::RetryRejected => write!(f, "request rejected after token refresh"),
            Self::SessionCleared => write!(f, "session was cleared"),
            Self::RefreshAbandoned => write!(f, "token refresh was abandoned"),
        }
    }
}

/// Errors returned by the API client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection, DNS or timeout failure from the transport
    #[error("Transport error ({kind}): {source}")]
    Transport {
        kind: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// Authentication cannot be recovered, the user has to log in again
    #[error("Session invalid: {0}")]
    SessionInvalid(SessionInvalidReason),

    /// Non-success status from the backend, body kept intact
    #[error("API error: {status} - {body}")]
    Api { status: u16, body: Value },

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Gave up waiting for an in-flight token refresh
    #[error("Timed out after {0:?} waiting for token refresh")]
    RefreshTimeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage and other internal failures
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_session_invalid(&self) -> bool {
        matches!(self, ClientError::SessionInvalid(_))
    }

    /// Classify a transport error for logging
    pub(crate) fn transport(source: reqwest::Error) -> Self {
        let kind = if source.is_timeout() {
            "timeout"
        } else if source.is_connect() {
            "connection_failed"
        } else if source.is_request() {
            "request_error"
        } else if source.is_body() {
            "body_error"
        } else if source.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };
        ClientError::Transport { kind, source }
    }
}

impl From<SessionInvalidReason> for ClientError {
    fn from(reason: SessionInvalidReason) -> Self {
        ClientError::SessionInvalid(reason)
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
