//! How a group's traffic reaches every server process.
//!
//! Three strategies implement [`DistributionStrategy`]:
//!
//! | Strategy | Publish | Relay |
//! |----------|---------|-------|
//! | [`LocalOnly`] | enqueue on the local hub | none |
//! | [`PerGroupChannel`] | broker topic `prefix + group` | one subscription per group |
//! | [`SharedChannel`] | broker topic `prefix + group` | one `prefix*` subscription per process |
//!
//! Remote strategies publish out-and-back: even local members receive a
//! message only after it round-trips through the broker.

mod local;
mod per_group;
mod relay;
mod shared;

pub use local::LocalOnly;
pub use per_group::PerGroupChannel;
pub use shared::SharedChannel;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use groupcast_broker::Broker;
use groupcast_settings::{GroupSettings, Topology};
use tokio_util::sync::CancellationToken;

use crate::directory::Directory;
use crate::errors::{GroupError, Result};
use crate::hub::Group;

/// Default topic prefix for [`PerGroupChannel`].
pub const DEFAULT_PER_GROUP_PREFIX: &str = "groupcast:group:";

/// Default topic prefix for [`SharedChannel`].
pub const DEFAULT_SHARED_PREFIX: &str = "groupcast:shared:";

/// Capability shared by the three topologies.
#[async_trait]
pub trait DistributionStrategy: Send + Sync + 'static {
    /// Hand `payload` to every member of `group`, wherever it is connected.
    ///
    /// Success means the payload was enqueued on the local hub or handed to
    /// the broker, never that any member received it.
    async fn publish(&self, group: &str, payload: Bytes) -> Result<()>;

    /// Called once for every newly created group instance.
    fn attach(&self, _group: &Group) {}

    /// Process-wide relay loop. Returns when shutdown is signalled, or
    /// immediately for strategies without one.
    async fn relay(&self, _directory: Arc<Directory>) {}

    /// Which topology this strategy implements.
    fn topology(&self) -> Topology;
}

/// Selects and configures a strategy.
#[derive(Clone)]
pub enum Distribution {
    /// No cross-process fan-out.
    Local,
    /// One broker subscription per group.
    PerGroup {
        /// Shared broker client.
        broker: Arc<dyn Broker>,
        /// Topic prefix; `None` selects [`DEFAULT_PER_GROUP_PREFIX`].
        label: Option<String>,
    },
    /// One pattern subscription for every group.
    Shared {
        /// Shared broker client.
        broker: Arc<dyn Broker>,
        /// Topic prefix; `None` selects [`DEFAULT_SHARED_PREFIX`].
        label: Option<String>,
    },
}

impl Distribution {
    /// Build the distribution described by `settings`. Remote topologies
    /// require a broker.
    pub fn from_settings(settings: &GroupSettings, broker: Option<Arc<dyn Broker>>) -> Result<Self> {
        let label = settings.label.clone();
        match (settings.topology, broker) {
            (Topology::Local, _) => Ok(Self::Local),
            (Topology::PerGroup, Some(broker)) => Ok(Self::PerGroup { broker, label }),
            (Topology::Shared, Some(broker)) => Ok(Self::Shared { broker, label }),
            (topology, None) => Err(GroupError::Usage(format!(
                "topology {topology:?} requires a broker"
            ))),
        }
    }

    /// Which topology this selects.
    pub fn topology(&self) -> Topology {
        match self {
            Self::Local => Topology::Local,
            Self::PerGroup { .. } => Topology::PerGroup,
            Self::Shared { .. } => Topology::Shared,
        }
    }

    /// Instantiate the strategy.
    ///
    /// `retry_delay` spaces broker subscription attempts; `shutdown` stops
    /// every relay loop.
    pub(crate) fn build(
        self,
        directory: &Arc<Directory>,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Result<Arc<dyn DistributionStrategy>> {
        Ok(match self {
            Self::Local => Arc::new(LocalOnly::new(directory.clone())),
            Self::PerGroup { broker, label } => {
                let prefix = resolve_prefix(label, DEFAULT_PER_GROUP_PREFIX)?;
                Arc::new(PerGroupChannel::new(broker, prefix, retry_delay, shutdown))
            }
            Self::Shared { broker, label } => {
                let prefix = resolve_prefix(label, DEFAULT_SHARED_PREFIX)?;
                Arc::new(SharedChannel::new(broker, prefix, retry_delay, shutdown))
            }
        })
    }
}

impl std::fmt::Debug for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("Local"),
            Self::PerGroup { label, .. } => f.debug_struct("PerGroup").field("label", label).finish(),
            Self::Shared { label, .. } => f.debug_struct("Shared").field("label", label).finish(),
        }
    }
}

/// `None` selects the default; a blank label is a usage error.
fn resolve_prefix(label: Option<String>, default: &str) -> Result<String> {
    match label {
        None => Ok(default.to_string()),
        Some(label) if label.trim().is_empty() => {
            Err(GroupError::Usage("label cannot be empty or blank".into()))
        }
        Some(label) => Ok(label),
    }
}
