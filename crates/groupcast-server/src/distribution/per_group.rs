use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use groupcast_broker::{Broker, escape};
use groupcast_settings::Topology;
use tokio_util::sync::CancellationToken;

use super::DistributionStrategy;
use super::relay::{Relay, Target};
use crate::errors::Result;
use crate::hub::Group;

/// One broker channel per group.
///
/// Every group instance gets its own relay subscribed to exactly
/// `prefix + name`, living until the instance retires or the process shuts
/// down. Glob characters in the name are escaped, so `room*` never hears
/// `roomA`.
pub struct PerGroupChannel {
    broker: Arc<dyn Broker>,
    prefix: String,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl PerGroupChannel {
    /// Create the strategy. `prefix` must already be validated.
    pub fn new(
        broker: Arc<dyn Broker>,
        prefix: String,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            prefix,
            retry_delay,
            shutdown,
        }
    }

    /// Broker topic for `group`.
    pub fn topic(&self, group: &str) -> String {
        format!("{}{group}", self.prefix)
    }
}

#[async_trait]
impl DistributionStrategy for PerGroupChannel {
    async fn publish(&self, group: &str, payload: Bytes) -> Result<()> {
        self.broker.publish(&self.topic(group), payload).await?;
        Ok(())
    }

    fn attach(&self, group: &Group) {
        let relay = Relay {
            broker: self.broker.clone(),
            pattern: escape(&self.topic(group.name())),
            retry_delay: self.retry_delay,
            topology: "per_group",
            target: Target::Group(group.clone()),
            shutdown: self.shutdown.clone(),
        };
        drop(tokio::spawn(relay.run()));
    }

    fn topology(&self) -> Topology {
        Topology::PerGroup
    }
}
