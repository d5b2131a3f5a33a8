//! Name → group mapping.
//!
//! Readers take a lock-free snapshot. Creation and deletion copy the map
//! under one writer mutex, re-checking after acquiring it, so at most one
//! live group exists per name.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use metrics::gauge;
use parking_lot::Mutex;
use tracing::debug;

use crate::hub::Group;
use crate::metrics::GROUPS_ACTIVE;

/// Owned registry of live groups.
pub struct Directory {
    groups: ArcSwap<HashMap<String, Group>>,
    writer: Mutex<()>,
    next_id: AtomicU64,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Current group for `name`, if any.
    pub fn get(&self, name: &str) -> Option<Group> {
        self.groups.load().get(name).cloned()
    }

    /// Existing group for `name`, or a fresh one whose hub queue holds
    /// `queue_len` events. The flag is `true` when this call created it.
    pub fn get_or_create(self: &Arc<Self>, name: &str, queue_len: usize) -> (Group, bool) {
        if let Some(group) = self.get(name) {
            return (group, false);
        }

        let _writer = self.writer.lock();
        let current = self.groups.load_full();
        if let Some(group) = current.get(name) {
            return (group.clone(), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let group = Group::spawn(name, id, queue_len, Arc::downgrade(self));
        let mut next = HashMap::clone(&current);
        let _ = next.insert(name.to_string(), group.clone());
        self.store(next);
        debug!(group = %name, id, "group created");
        (group, true)
    }

    /// Remove `group` if it is still the registered instance for its name and
    /// has no members. Returns whether it was removed.
    pub fn delete_if_empty(&self, group: &Group) -> bool {
        let _writer = self.writer.lock();
        let current = self.groups.load_full();
        let same_instance = current
            .get(group.name())
            .is_some_and(|registered| registered.id() == group.id());
        if !same_instance || group.member_count() != 0 {
            return false;
        }

        let mut next = HashMap::clone(&current);
        let _ = next.remove(group.name());
        self.store(next);
        debug!(group = %group.name(), id = group.id(), "group deleted");
        true
    }

    /// Number of live groups.
    pub fn len(&self) -> usize {
        self.groups.load().len()
    }

    /// Whether no group is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of every live group.
    pub fn names(&self) -> Vec<String> {
        self.groups.load().keys().cloned().collect()
    }

    /// Total members across live groups.
    pub fn member_count(&self) -> usize {
        self.groups.load().values().map(Group::member_count).sum()
    }

    fn store(&self, next: HashMap<String, Group>) {
        #[allow(clippy::cast_precision_loss)]
        gauge!(GROUPS_ACTIVE).set(next.len() as f64);
        self.groups.store(Arc::new(next));
    }
}
