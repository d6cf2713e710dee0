//! Unified gateway error type.
//!
//! One error type crosses every layer of the runtime. The `kind` carries the
//! taxonomy the gateway's failure isolation is built on: connection errors
//! stay on their backend, flow and replay errors are rejected to the caller,
//! and nothing here is ever allowed to take the process down.

use crate::jsonrpc::{codes, JsonRpcError};
use std::fmt;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Classification of a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend connection failed; retried only via reload or OAuth completion
    Connection,
    /// Required subprocess environment is missing; terminal until reconfigured
    PendingInput,
    /// OAuth exchange or token failure
    Auth,
    /// Unknown or already-consumed OAuth flow state
    FlowNotFound,
    /// Replay anchor pruned from the delivery log
    ReplayExpired,
    /// An operation exceeded its deadline; a normal failure outcome
    Timeout,
    /// Named backend, session or tool does not exist
    NotFound,
    /// Caller is not permitted to perform the operation
    PermissionDenied,
    /// Configuration is invalid or was rejected
    Config,
    /// Transport-level failure (I/O, process, HTTP)
    Transport,
    /// Peer sent something that violates the protocol
    Protocol,
    /// Invariant violation inside the gateway
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::PendingInput => "pending-input",
            ErrorKind::Auth => "auth",
            ErrorKind::FlowNotFound => "flow-not-found",
            ErrorKind::ReplayExpired => "replay-expired",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::Config => "config",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// The unified gateway error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable description
    pub message: String,
}

impl GatewayError {
    /// Create an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Backend connection failure.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// Missing subprocess environment.
    pub fn pending_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PendingInput, message)
    }

    /// OAuth failure.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    /// Unknown or consumed OAuth flow.
    pub fn flow_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FlowNotFound, message)
    }

    /// Pruned replay anchor.
    pub fn replay_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReplayExpired, message)
    }

    /// Deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Missing backend/session/tool.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Permission denied.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// Invalid configuration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Internal invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Map into the protocol's error envelope for client-facing responses.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let code = match self.kind {
            ErrorKind::ReplayExpired => codes::REPLAY_EXPIRED,
            ErrorKind::NotFound | ErrorKind::Connection | ErrorKind::PendingInput => {
                codes::NOT_AVAILABLE
            }
            ErrorKind::PermissionDenied => codes::PERMISSION_DENIED,
            ErrorKind::Protocol => codes::INVALID_REQUEST,
            ErrorKind::Internal => codes::INTERNAL_ERROR,
            _ => codes::SERVER_ERROR,
        };
        JsonRpcError::new(code, self.message.clone())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::transport(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::protocol(format!("malformed JSON: {err}"))
    }
}
