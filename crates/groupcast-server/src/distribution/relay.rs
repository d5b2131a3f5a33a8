//! Broker → hub relay loop shared by the remote strategies.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use groupcast_broker::{Broker, BrokerMessage};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::directory::Directory;
use crate::hub::Group;
use crate::metrics::RELAY_RETRIES_TOTAL;

/// Where relayed messages go.
pub(super) enum Target {
    /// Every message feeds one group instance; the relay stops when it retires.
    Group(Group),
    /// Messages are routed by stripping `prefix` from the topic.
    Directory {
        directory: Arc<Directory>,
        prefix: String,
    },
}

impl Target {
    async fn deliver(&self, msg: BrokerMessage) {
        match self {
            Self::Group(group) => {
                let _ = group.broadcast(msg.payload).await;
            }
            Self::Directory { directory, prefix } => {
                let Some(name) = msg.topic.strip_prefix(prefix.as_str()) else {
                    trace!(topic = %msg.topic, "relayed topic outside prefix, dropping");
                    return;
                };
                match directory.get(name) {
                    Some(group) => {
                        let _ = group.broadcast(msg.payload).await;
                    }
                    None => trace!(group = %name, "no local group, dropping relayed message"),
                }
            }
        }
    }

    async fn stopped(&self, shutdown: &CancellationToken) {
        match self {
            Self::Group(group) => {
                tokio::select! {
                    () = group.retired() => {}
                    () = shutdown.cancelled() => {}
                }
            }
            Self::Directory { .. } => shutdown.cancelled().await,
        }
    }
}

/// One subscription kept alive until the target or the process stops.
pub(super) struct Relay {
    pub(super) broker: Arc<dyn Broker>,
    pub(super) pattern: String,
    pub(super) retry_delay: Duration,
    pub(super) topology: &'static str,
    pub(super) target: Target,
    pub(super) shutdown: CancellationToken,
}

impl Relay {
    /// Subscribe, forward, and resubscribe after failures with a fixed delay
    /// and no attempt ceiling.
    pub(super) async fn run(self) {
        loop {
            let subscribed = tokio::select! {
                () = self.target.stopped(&self.shutdown) => break,
                res = self.broker.subscribe(&self.pattern) => res,
            };

            match subscribed {
                Ok(mut subscription) => {
                    debug!(pattern = %self.pattern, topology = self.topology, "relay subscribed");
                    loop {
                        tokio::select! {
                            () = self.target.stopped(&self.shutdown) => {
                                debug!(pattern = %self.pattern, "relay stopped");
                                return;
                            }
                            msg = subscription.next() => match msg {
                                Some(msg) => self.target.deliver(msg).await,
                                None => {
                                    warn!(pattern = %self.pattern, "relay subscription ended, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    counter!(RELAY_RETRIES_TOTAL, "topology" => self.topology).increment(1);
                    warn!(
                        pattern = %self.pattern,
                        error = %error,
                        retry_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        "relay subscription failed, retrying"
                    );
                }
            }

            tokio::select! {
                () = self.target.stopped(&self.shutdown) => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        debug!(pattern = %self.pattern, "relay stopped");
    }
}
