//! Error types for Tether.
//!
//! Two families live here. [`TetherError`] is what callers see: every client
//! call, event raise and socket failure ends up as one of its variants, tagged
//! with an [`ErrorOrigin`] so a caller can tell whether the remote method ran
//! at all. [`DispatchError`] is the server pipeline's rejection type and knows
//! how to map itself onto an HTTP status and a wire [`RpcError`].

use crate::codec::CodecError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Structured error carried as the body of a failed response.
///
/// The stack trace is optional; client-originated errors and fixed protocol
/// rejections leave it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl RpcError {
    /// Create an error with a message and no stack trace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
        }
    }

    /// Attach a stack/detail string.
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Build an error from an `anyhow` chain.
    ///
    /// The outermost message becomes `message`; the full cause chain is kept
    /// as the detail string when there is more than one link.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let mut chain = err.chain().skip(1).peekable();
        if chain.peek().is_none() {
            return Self::new(err.to_string());
        }
        let detail = chain
            .map(|cause| format!("caused by: {}", cause))
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(err.to_string()).with_stack_trace(detail)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Which side of the wire a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    /// Failed locally; the remote method did not execute.
    Client,
    /// Failed on the server (or on the server-to-client event leg).
    Server,
}

/// Main error type for Tether callers.
#[derive(Debug, Error)]
pub enum TetherError {
    // Client-side failures
    #[error("rpc request error. {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("rpc codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to deserialize response data: {message}")]
    ResponseDecode {
        message: String,
        #[source]
        source: Option<CodecError>,
    },

    #[error("unknown member {member} on {interface}")]
    UnknownMember { interface: String, member: String },

    // Server-side failures
    #[error("rpc request error. http.response.status_code={status}. see detail for more information.")]
    Remote { status: u16, detail: RpcError },

    #[error("rpc request error. http.response.status_code={status}.")]
    Http { status: u16, content: String },

    // Event leg failures
    #[error("ws connection broken, instance = {instance_id}, {reason}")]
    ConnectionBroken { instance_id: Uuid, reason: String },

    #[error("event delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote event handler failed: {0}")]
    EventHandler(RpcError),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<reqwest::Error> for TetherError {
    fn from(err: reqwest::Error) -> Self {
        TetherError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio::task::JoinError> for TetherError {
    fn from(err: tokio::task::JoinError) -> Self {
        TetherError::Other(format!("background call failed: {}", err))
    }
}

impl TetherError {
    /// Create a connection-broken error for an instance.
    pub fn connection_broken(instance_id: Uuid, reason: impl Into<String>) -> Self {
        TetherError::ConnectionBroken {
            instance_id,
            reason: reason.into(),
        }
    }

    /// Where the failure originated.
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            TetherError::Transport { .. }
            | TetherError::Codec(_)
            | TetherError::ResponseDecode { .. }
            | TetherError::UnknownMember { .. }
            | TetherError::Other(_) => ErrorOrigin::Client,

            TetherError::Remote { .. }
            | TetherError::Http { .. }
            | TetherError::ConnectionBroken { .. }
            | TetherError::Timeout(_)
            | TetherError::EventHandler(_) => ErrorOrigin::Server,
        }
    }

    /// Structured server detail, when the failure carried one.
    pub fn detail(&self) -> Option<&RpcError> {
        match self {
            TetherError::Remote { detail, .. } => Some(detail),
            TetherError::EventHandler(detail) => Some(detail),
            _ => None,
        }
    }

    /// HTTP status of a server rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            TetherError::Remote { status, .. } | TetherError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Convert into the wire form used on the event reply leg.
    pub fn to_rpc_error(&self) -> RpcError {
        match self.detail() {
            Some(detail) => detail.clone(),
            None => RpcError::new(self.to_string()),
        }
    }
}

/// Rejection produced by the server dispatch pipeline.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Malformed metadata, unknown interface or method, undecodable body.
    #[error("{0}")]
    Protocol(String),

    #[error("request data is limited in 10Mb")]
    PayloadTooLarge,

    #[error("access denied.")]
    Unauthorized,

    /// Output of an exception hook for a failure raised by business code.
    #[error("{0}")]
    Business(RpcError),
}

impl DispatchError {
    pub const MISSING_METADATA: &'static str = "invalid rpc request metadata";
    pub const UNKNOWN_INTERFACE: &'static str = "invalid rpc request metadata, unknown interface.";
    pub const UNKNOWN_METHOD: &'static str =
        "invalid rpc request metadata, unknown method under the interface.";

    /// HTTP status code for this rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::Unauthorized => 401,
            DispatchError::Protocol(_)
            | DispatchError::PayloadTooLarge
            | DispatchError::Business(_) => 500,
        }
    }

    /// Wire body for this rejection.
    ///
    /// Protocol and authorization rejections never carry a stack trace.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            DispatchError::Business(err) => err.clone(),
            other => RpcError::new(other.to_string()),
        }
    }
}
