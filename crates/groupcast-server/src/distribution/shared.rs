use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use groupcast_broker::{Broker, escape};
use groupcast_settings::Topology;
use tokio_util::sync::CancellationToken;

use super::DistributionStrategy;
use super::relay::{Relay, Target};
use crate::directory::Directory;
use crate::errors::Result;

/// One broker pattern subscription shared by every group in the process.
///
/// Incoming topics have the prefix stripped to recover the group name.
/// A group name that itself starts with another deployment's prefix is not
/// detected.
pub struct SharedChannel {
    broker: Arc<dyn Broker>,
    prefix: String,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl SharedChannel {
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
}

#[async_trait]
impl DistributionStrategy for SharedChannel {
    async fn publish(&self, group: &str, payload: Bytes) -> Result<()> {
        let topic = format!("{}{group}", self.prefix);
        self.broker.publish(&topic, payload).await?;
        Ok(())
    }

    async fn relay(&self, directory: Arc<Directory>) {
        Relay {
            broker: self.broker.clone(),
            pattern: format!("{}*", escape(&self.prefix)),
            retry_delay: self.retry_delay,
            topology: "shared",
            target: Target::Directory {
                directory,
                prefix: self.prefix.clone(),
            },
            shutdown: self.shutdown.clone(),
        }
        .run()
        .await;
    }

    fn topology(&self) -> Topology {
        Topology::Shared
    }
}
