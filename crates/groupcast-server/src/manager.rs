//! `GroupManager`: the public entry point for grouped connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use groupcast_settings::{GroupcastSettings, Topology};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{CloseHandle, Connection};
use crate::directory::Directory;
use crate::distribution::{Distribution, DistributionStrategy};
use crate::errors::{GroupError, Result, TransportError};
use crate::hub::Rejected;
use crate::member::{GroupExtensions, Hooks, Member, MemberId};
use crate::pump::{LiveConnections, Pump, PumpConfig, Route};
use crate::standalone::StandaloneConfig;
use crate::upgrade::UpgradeConfig;

/// Member outbound queues hold this many times the hub queue length.
const MEMBER_QUEUE_FACTOR: usize = 3;

/// Construction parameters for a [`GroupManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Hub event queue length.
    pub max_queue_length: usize,
    /// Pump timing and limits.
    pub pump: PumpConfig,
    /// Delay between relay subscription attempts.
    pub relay_retry_delay: Duration,
    /// Upgrade parameters.
    pub upgrade: UpgradeConfig,
    /// Outbound queue length for standalone connections.
    pub standalone_queue_length: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&GroupcastSettings::default())
    }
}

impl ManagerConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &GroupcastSettings) -> Self {
        Self {
            max_queue_length: settings.group.max_queue_length,
            pump: PumpConfig::from(&settings.connection),
            relay_retry_delay: settings.group.relay_retry_delay(),
            upgrade: UpgradeConfig::from_settings(&settings.upgrade, &settings.connection),
            standalone_queue_length: settings.connection.standalone_queue_length,
        }
    }
}

/// Owns the group directory and the distribution strategy for one process.
pub struct GroupManager {
    directory: Arc<Directory>,
    distribution: Arc<dyn DistributionStrategy>,
    max_queue_length: AtomicUsize,
    upgrade: RwLock<UpgradeConfig>,
    pump: PumpConfig,
    standalone_queue_length: usize,
    live: LiveConnections,
}

impl GroupManager {
    /// Create a manager. For the shared topology this also starts the
    /// process-wide relay, which stops when `shutdown` is cancelled.
    pub fn new(
        config: ManagerConfig,
        distribution: Distribution,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let directory = Directory::new();
        let strategy = distribution.build(&directory, config.relay_retry_delay, shutdown)?;

        if strategy.topology() == Topology::Shared {
            let relay = strategy.clone();
            let relay_directory = directory.clone();
            drop(tokio::spawn(async move { relay.relay(relay_directory).await }));
        }

        debug!(topology = ?strategy.topology(), "group manager created");
        Ok(Arc::new(Self {
            directory,
            distribution: strategy,
            max_queue_length: AtomicUsize::new(config.max_queue_length.max(1)),
            upgrade: RwLock::new(config.upgrade),
            pump: config.pump,
            standalone_queue_length: config.standalone_queue_length.max(1),
            live: LiveConnections::default(),
        }))
    }

    /// Single-process manager with default settings.
    pub fn local() -> Arc<Self> {
        let directory = Directory::new();
        let config = ManagerConfig::default();
        Arc::new(Self {
            distribution: Arc::new(crate::distribution::LocalOnly::new(directory.clone())),
            directory,
            max_queue_length: AtomicUsize::new(config.max_queue_length),
            upgrade: RwLock::new(config.upgrade),
            pump: config.pump,
            standalone_queue_length: config.standalone_queue_length,
            live: LiveConnections::default(),
        })
    }

    /// Upgrade the request and join the resulting connection to `group`.
    pub fn add_group(
        self: &Arc<Self>,
        group: &str,
        upgrade: WebSocketUpgrade,
        headers: &HeaderMap,
    ) -> Result<Response> {
        self.add_group_with_extensions(group, upgrade, headers, GroupExtensions::default())
    }

    /// [`add_group`](Self::add_group) with close data, close callback and
    /// inbound transform.
    pub fn add_group_with_extensions(
        self: &Arc<Self>,
        group: &str,
        upgrade: WebSocketUpgrade,
        headers: &HeaderMap,
        extensions: GroupExtensions,
    ) -> Result<Response> {
        if group.is_empty() {
            return Err(GroupError::empty_group_name());
        }
        let config = self.upgrade_config();
        config.check_origin(headers)?;

        let deadline = config.deadline();
        let manager = Arc::clone(self);
        let group = group.to_string();
        Ok(config.apply(upgrade).on_upgrade(move |socket| async move {
            let connection = Connection::from_websocket(socket);
            let joined =
                tokio::time::timeout_at(deadline, manager.join(&group, connection, extensions)).await;
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => warn!(group = %group, error = %error, "join after upgrade failed"),
                Err(_) => warn!(group = %group, "handshake timed out before the connection joined"),
            }
        }))
    }

    /// Join an already established connection to `group` and start its pump.
    ///
    /// Creates the group on first join. Resolves once the hub acknowledged
    /// the registration.
    pub async fn join(
        &self,
        group: &str,
        connection: Connection,
        extensions: GroupExtensions,
    ) -> Result<MemberId> {
        if group.is_empty() {
            return Err(GroupError::empty_group_name());
        }

        let queue_len = self.max_queue_length();
        let (tx, rx) = mpsc::channel(queue_len.saturating_mul(MEMBER_QUEUE_FACTOR));
        let id = MemberId::new();
        let close = CloseHandle::new();
        let mut member = Member {
            id,
            outbound: tx,
            close: close.clone(),
        };

        let joined = loop {
            let (candidate, created) = self.directory.get_or_create(group, queue_len);
            if created {
                self.distribution.attach(&candidate);
            }
            match candidate.register(member).await {
                Ok(()) => break candidate,
                Err(Rejected::Retired(back)) => {
                    debug!(group = %group, member = %id, "group retired during join, retrying");
                    member = back;
                    tokio::task::yield_now().await;
                }
                Err(Rejected::HubGone) => return Err(TransportError::Closed.into()),
            }
        };

        Pump {
            id,
            connection,
            outbound: rx,
            route: Route::Group {
                group: joined,
                member: id,
                distribution: self.distribution.clone(),
            },
            hooks: Arc::new(Hooks::new(extensions)),
            close,
            config: self.pump,
            live: self.live.clone(),
        }
        .spawn();
        Ok(id)
    }

    /// Publish `payload` to every member of `group`.
    ///
    /// Success means the payload was handed to the broker (remote
    /// topologies) or enqueued on the local hub.
    pub async fn send_message(&self, group: &str, payload: impl Into<Bytes>) -> Result<()> {
        if group.is_empty() {
            return Err(GroupError::empty_group_name());
        }
        self.distribution.publish(group, payload.into()).await
    }

    /// Hub queue length for groups created from now on. Member queues get
    /// three times this. Zero is clamped to one.
    pub fn set_max_queue_length(&self, len: usize) {
        self.max_queue_length.store(len.max(1), Ordering::Relaxed);
    }

    /// Current hub queue length.
    pub fn max_queue_length(&self) -> usize {
        self.max_queue_length.load(Ordering::Relaxed)
    }

    /// Replace the upgrade parameters for future upgrades.
    pub fn set_upgrade_config(&self, config: UpgradeConfig) {
        *self.upgrade.write() = config;
    }

    /// Current upgrade parameters.
    pub fn upgrade_config(&self) -> UpgradeConfig {
        self.upgrade.read().clone()
    }

    /// Parameters for standalone connections sharing this manager's limits
    /// and connection count.
    pub fn standalone_config(&self) -> StandaloneConfig {
        StandaloneConfig {
            upgrade: self.upgrade_config(),
            pump: self.pump,
            queue_length: self.standalone_queue_length,
            live: self.live.clone(),
        }
    }

    /// The group directory.
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Active distribution topology.
    pub fn topology(&self) -> Topology {
        self.distribution.topology()
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.directory.len()
    }

    /// Number of live connections, grouped and standalone.
    pub fn connection_count(&self) -> usize {
        self.live.get()
    }
}

#[cfg(test)]
mod tests {
    use groupcast_broker::{Broker, MemoryBroker};

    use super::*;
    use crate::connection::RemotePeer;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn connect(manager: &GroupManager, group: &str) -> RemotePeer {
        let (conn, peer) = Connection::loopback();
        let _ = manager.join(group, conn, GroupExtensions::default()).await.unwrap();
        peer
    }

    fn remote(broker: &Arc<MemoryBroker>, shared: bool, shutdown: &CancellationToken) -> Arc<GroupManager> {
        let broker: Arc<dyn Broker> = broker.clone();
        let distribution = if shared {
            Distribution::Shared { broker, label: None }
        } else {
            Distribution::PerGroup { broker, label: None }
        };
        let config = ManagerConfig {
            relay_retry_delay: Duration::from_millis(10),
            ..ManagerConfig::default()
        };
        GroupManager::new(config, distribution, shutdown.clone()).unwrap()
    }

    #[tokio::test]
    async fn chat_scenario_delivers_to_both_members() {
        let manager = GroupManager::local();
        let mut a = connect(&manager, "chat").await;
        let mut b = connect(&manager, "chat").await;
        assert_eq!(manager.directory().get("chat").unwrap().member_count(), 2);

        manager.send_message("chat", "hi").await.unwrap();
        assert_eq!(a.recv_message().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(b.recv_message().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.group_count(), 1);
    }

    #[tokio::test]
    async fn empty_group_name_is_rejected() {
        let manager = GroupManager::local();
        let (conn, _peer) = Connection::loopback();
        let err = manager.join("", conn, GroupExtensions::default()).await.unwrap_err();
        assert!(matches!(err, GroupError::Usage(_)));
        let err = manager.send_message("", "x").await.unwrap_err();
        assert!(matches!(err, GroupError::Usage(_)));
        assert_eq!(manager.group_count(), 0);
    }

    #[tokio::test]
    async fn send_to_unknown_group_is_ok() {
        let manager = GroupManager::local();
        manager.send_message("nobody", "x").await.unwrap();
        assert_eq!(manager.group_count(), 0);
    }

    #[tokio::test]
    async fn queue_length_is_clamped_and_applied() {
        let manager = GroupManager::local();
        manager.set_max_queue_length(0);
        assert_eq!(manager.max_queue_length(), 1);
        manager.set_max_queue_length(7);
        assert_eq!(manager.max_queue_length(), 7);
    }

    #[tokio::test]
    async fn upgrade_config_is_replaceable() {
        let manager = GroupManager::local();
        let cfg = UpgradeConfig {
            max_message_size: 4096,
            ..UpgradeConfig::default()
        };
        manager.set_upgrade_config(cfg);
        assert_eq!(manager.upgrade_config().max_message_size, 4096);
    }

    #[tokio::test]
    async fn rejoin_after_group_retired_creates_fresh_instance() {
        let manager = GroupManager::local();
        let mut first = connect(&manager, "cycle").await;
        let old_id = manager.directory().get("cycle").unwrap().id();
        first.hang_up();
        wait_until(|| manager.directory().get("cycle").is_none()).await;

        let mut second = connect(&manager, "cycle").await;
        let fresh = manager.directory().get("cycle").unwrap();
        assert_ne!(fresh.id(), old_id);
        manager.send_message("cycle", "again").await.unwrap();
        assert_eq!(second.recv_message().await.unwrap(), Bytes::from_static(b"again"));
    }

    #[tokio::test]
    async fn per_group_reaches_both_processes() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = CancellationToken::new();
        let process_a = remote(&broker, false, &shutdown);
        let process_b = remote(&broker, false, &shutdown);
        let mut on_a = connect(&process_a, "chat").await;
        let mut on_b = connect(&process_b, "chat").await;
        wait_until(|| broker.subscriber_count() == 2).await;

        process_a.send_message("chat", "from a").await.unwrap();
        assert_eq!(on_a.recv_message().await.unwrap(), Bytes::from_static(b"from a"));
        assert_eq!(on_b.recv_message().await.unwrap(), Bytes::from_static(b"from a"));
        assert_eq!(process_a.topology(), Topology::PerGroup);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shared_channel_reaches_both_processes() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = CancellationToken::new();
        let process_a = remote(&broker, true, &shutdown);
        let process_b = remote(&broker, true, &shutdown);
        wait_until(|| broker.subscriber_count() == 2).await;
        let mut on_a = connect(&process_a, "g").await;
        let mut on_b = connect(&process_b, "g").await;

        process_b.send_message("g", "shared").await.unwrap();
        assert_eq!(on_a.recv_message().await.unwrap(), Bytes::from_static(b"shared"));
        assert_eq!(on_b.recv_message().await.unwrap(), Bytes::from_static(b"shared"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn broker_publish_failure_surfaces() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = CancellationToken::new();
        let manager = remote(&broker, true, &shutdown);
        broker.fail_next_publishes(1);
        let err = manager.send_message("g", "x").await.unwrap_err();
        assert!(matches!(err, GroupError::Broker(_)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn blank_label_fails_construction() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let result = GroupManager::new(
            ManagerConfig::default(),
            Distribution::Shared {
                broker,
                label: Some("  ".into()),
            },
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(GroupError::Usage(_))));
    }
}
