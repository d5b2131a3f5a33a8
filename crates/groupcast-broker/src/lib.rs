//! # groupcast-broker
//!
//! The publish/subscribe seam that carries group traffic between server
//! processes.
//!
//! A broker is treated as an at-least-once fan-out primitive with no ordering
//! across publishers and no retained history:
//!
//! - [`Broker::publish`] hands one payload to every current subscriber whose
//!   pattern matches the topic
//! - [`Broker::subscribe`] resolves once the subscription is confirmed, then
//!   yields `(topic, payload)` pairs until the broker connection is lost
//!
//! [`MemoryBroker`] is an in-process implementation used by single-binary
//! deployments and tests. Several managers sharing one `MemoryBroker` behave
//! like several processes sharing one external broker.

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod pattern;

pub use errors::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use pattern::{escape, glob_match};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// One message delivered by a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Stream of messages for one subscription. Ends when the broker connection
/// backing it is lost.
pub type Subscription = BoxStream<'static, BrokerMessage>;

/// External publish/subscribe service.
///
/// Implementations must be safe for concurrent `publish` calls from many
/// tasks; one client is shared by every relay in a process.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to every topic matching the glob `pattern`.
    ///
    /// Resolves only after the subscription is confirmed, so a failure here
    /// can be retried by the caller.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;
}
