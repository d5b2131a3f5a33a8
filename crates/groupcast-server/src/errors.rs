//! Error taxonomy for the group API.
//!
//! - [`GroupError::Usage`]: caller mistakes, returned synchronously and never retried
//! - [`GroupError::Transport`]: a single connection failed; never affects other members
//! - [`GroupError::Broker`]: a publish was rejected; the caller decides whether to retry
//!
//! Backpressure eviction is deliberately absent: dropping a slow member is a
//! policy action, logged and counted but never reported as an error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use groupcast_broker::BrokerError;
use thiserror::Error;

/// Failures of one physical connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The upgrade request came from an origin the check rejected.
    #[error("origin rejected: {0}")]
    OriginRejected(String),

    /// A frame write did not complete within the write deadline.
    #[error("write timed out")]
    WriteTimeout,

    /// No pong arrived within the read deadline.
    #[error("read deadline exceeded")]
    ReadTimeout,

    /// The peer sent a message above the configured read limit.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Received size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,

    /// Error surfaced by the underlying protocol implementation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<axum::Error> for TransportError {
    fn from(err: axum::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Errors returned by [`GroupManager`](crate::manager::GroupManager) and
/// [`StandaloneConnection`](crate::standalone::StandaloneConnection).
#[derive(Debug, Error)]
pub enum GroupError {
    /// Invalid arguments such as an empty group name or blank label.
    #[error("usage error: {0}")]
    Usage(String),

    /// The connection could not be established or is gone.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The broker rejected a publish.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl GroupError {
    /// Shorthand for the empty-group-name usage error.
    pub(crate) fn empty_group_name() -> Self {
        Self::Usage("group name is empty".into())
    }

    /// HTTP status for errors that end an upgrade request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Usage(_) => StatusCode::BAD_REQUEST,
            Self::Transport(TransportError::OriginRejected(_)) => StatusCode::FORBIDDEN,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GroupError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Result type for group operations.
pub type Result<T> = std::result::Result<T, GroupError>;
