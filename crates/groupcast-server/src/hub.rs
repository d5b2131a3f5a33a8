//! Group hub: one control loop per group that owns its membership.
//!
//! Register, unregister and broadcast requests travel over a single bounded
//! event queue, so the hub observes them in strict first-come order. The hub
//! only ever touches a member's outbound sender and its non-blocking close
//! handle; it never performs I/O on a connection.
//!
//! When membership drops to zero the hub retires: it removes its own
//! [`Directory`] entry, signals retirement, closes its queue and hands every
//! still-buffered registration back to its joiner, who retries through the
//! directory and lands in a fresh hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::member::{Member, MemberId};
use crate::metrics::{BROADCASTS_TOTAL, EVICTIONS_TOTAL};

/// Requests handled by a hub loop.
pub(crate) enum HubEvent {
    Register {
        member: Member,
        ack: oneshot::Sender<Result<(), Member>>,
    },
    Unregister(MemberId),
    Broadcast(Bytes),
}

/// Why a registration did not land.
#[derive(Debug)]
pub(crate) enum Rejected {
    /// The hub retired first; the member is handed back for a retry.
    Retired(Member),
    /// The hub vanished without answering.
    HubGone,
}

struct GroupShared {
    id: u64,
    name: String,
    events: mpsc::Sender<HubEvent>,
    members: AtomicUsize,
    retired: CancellationToken,
}

/// Handle to one live group instance.
///
/// Cheap to clone. A handle outlives its hub: once the hub retires every
/// operation becomes a no-op and [`Group::is_retired`] turns true.
#[derive(Clone)]
pub struct Group {
    shared: Arc<GroupShared>,
}

impl Group {
    /// Spawn the hub loop for a new group instance.
    pub(crate) fn spawn(name: &str, id: u64, queue_len: usize, directory: Weak<Directory>) -> Self {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let group = Self {
            shared: Arc::new(GroupShared {
                id,
                name: name.to_string(),
                events: tx,
                members: AtomicUsize::new(0),
                retired: CancellationToken::new(),
            }),
        };
        let hub = Hub {
            group: group.clone(),
            events: rx,
            members: HashMap::new(),
            directory,
        };
        drop(tokio::spawn(hub.run()));
        group
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Instance id. A name recreated after deletion gets a new id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Members currently registered, as last published by the hub.
    pub fn member_count(&self) -> usize {
        self.shared.members.load(Ordering::Acquire)
    }

    /// Whether the hub has retired.
    pub fn is_retired(&self) -> bool {
        self.shared.retired.is_cancelled()
    }

    /// Resolves once the hub retires.
    pub async fn retired(&self) {
        self.shared.retired.cancelled().await;
    }

    /// Enqueue a broadcast. Returns `false` if the hub already retired.
    pub async fn broadcast(&self, payload: Bytes) -> bool {
        self.shared.events.send(HubEvent::Broadcast(payload)).await.is_ok()
    }

    /// Register a member and wait for the hub to acknowledge it.
    pub(crate) async fn register(&self, member: Member) -> Result<(), Rejected> {
        let (ack, answer) = oneshot::channel();
        if let Err(mpsc::error::SendError(event)) =
            self.shared.events.send(HubEvent::Register { member, ack }).await
        {
            return match event {
                HubEvent::Register { member, .. } => Err(Rejected::Retired(member)),
                _ => Err(Rejected::HubGone),
            };
        }
        match answer.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(member)) => Err(Rejected::Retired(member)),
            Err(_) => Err(Rejected::HubGone),
        }
    }

    /// Ask the hub to drop a member. Absent members and retired hubs are no-ops.
    pub(crate) async fn unregister(&self, id: MemberId) {
        let _ = self.shared.events.send(HubEvent::Unregister(id)).await;
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .field("members", &self.member_count())
            .field("retired", &self.is_retired())
            .finish()
    }
}

struct Hub {
    group: Group,
    events: mpsc::Receiver<HubEvent>,
    members: HashMap<MemberId, Member>,
    directory: Weak<Directory>,
}

impl Hub {
    async fn run(mut self) {
        debug!(group = %self.group.name(), id = self.group.id(), "hub started");
        while let Some(event) = self.events.recv().await {
            let emptied = match event {
                HubEvent::Register { member, ack } => self.register(member, ack),
                HubEvent::Unregister(id) => self.unregister(id),
                HubEvent::Broadcast(payload) => self.broadcast(&payload),
            };
            if emptied {
                break;
            }
        }
        self.retire().await;
    }

    fn publish_count(&self) {
        self.group
            .shared
            .members
            .store(self.members.len(), Ordering::Release);
    }

    /// Returns `true` if membership dropped to zero.
    fn register(&mut self, member: Member, ack: oneshot::Sender<Result<(), Member>>) -> bool {
        let id = member.id;
        let _ = self.members.insert(id, member);
        self.publish_count();
        if ack.send(Ok(())).is_err() {
            // Joiner gave up before the ack; its pump never starts.
            let _ = self.members.remove(&id);
            self.publish_count();
            return self.members.is_empty();
        }
        debug!(
            group = %self.group.name(),
            member = %id,
            members = self.members.len(),
            "member registered"
        );
        false
    }

    fn unregister(&mut self, id: MemberId) -> bool {
        if self.members.remove(&id).is_none() {
            return false;
        }
        self.publish_count();
        debug!(
            group = %self.group.name(),
            member = %id,
            members = self.members.len(),
            "member unregistered"
        );
        self.members.is_empty()
    }

    fn broadcast(&mut self, payload: &Bytes) -> bool {
        counter!(BROADCASTS_TOTAL).increment(1);
        let mut evicted = Vec::new();
        let mut gone = Vec::new();
        for (id, member) in &self.members {
            match member.outbound.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => evicted.push(*id),
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        if evicted.is_empty() && gone.is_empty() {
            return false;
        }

        for id in evicted {
            if let Some(member) = self.members.remove(&id) {
                member.close.close();
                counter!(EVICTIONS_TOTAL).increment(1);
                warn!(
                    group = %self.group.name(),
                    member = %id,
                    "outbound queue full, evicting member"
                );
            }
        }
        for id in gone {
            if self.members.remove(&id).is_some() {
                debug!(group = %self.group.name(), member = %id, "outbound queue closed, removing member");
            }
        }
        self.publish_count();
        self.members.is_empty()
    }

    async fn retire(mut self) {
        if let Some(directory) = self.directory.upgrade() {
            let _ = directory.delete_if_empty(&self.group);
        }
        self.group.shared.retired.cancel();
        self.events.close();
        while let Some(event) = self.events.recv().await {
            if let HubEvent::Register { member, ack } = event {
                let _ = ack.send(Err(member));
            }
        }
        debug!(group = %self.group.name(), id = self.group.id(), "hub retired");
    }
}
