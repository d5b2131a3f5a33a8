//! Broker error types.

use thiserror::Error;

/// Errors reported by a [`Broker`](crate::Broker).
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A publish was rejected.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Topic the publish targeted.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// A subscription could not be confirmed.
    #[error("subscribe to {pattern} failed: {reason}")]
    Subscribe {
        /// Pattern the subscription targeted.
        pattern: String,
        /// Broker-reported reason.
        reason: String,
    },
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
