//! Group members and the per-connection extension hooks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::CloseHandle;

/// Identifier of one connection's membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member_{}", self.0.simple())
    }
}

/// The hub-side view of a member: everything the hub may touch.
pub(crate) struct Member {
    pub(crate) id: MemberId,
    pub(crate) outbound: mpsc::Sender<Bytes>,
    pub(crate) close: CloseHandle,
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Invoked once, asynchronously, after a connection closes.
pub type CloseCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Rewrites or drops an inbound payload. `None` drops it.
pub type InboundTransform = Arc<dyn Fn(Bytes) -> Option<Bytes> + Send + Sync>;

/// Optional per-connection behavior supplied at join time.
#[derive(Clone, Default)]
pub struct GroupExtensions {
    /// Payload handed to the close callback. `Value::Null` when unset.
    pub close_data: Option<Value>,
    /// Called after the connection closes.
    pub close_callback: Option<CloseCallback>,
    /// Applied to every inbound message before it is published.
    pub inbound_transform: Option<InboundTransform>,
}

impl GroupExtensions {
    /// Set the payload passed to the close callback.
    #[must_use]
    pub fn with_close_data(mut self, data: Value) -> Self {
        self.close_data = Some(data);
        self
    }

    /// Set the close callback.
    #[must_use]
    pub fn with_close_callback(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.close_callback = Some(Arc::new(callback));
        self
    }

    /// Set the inbound transform.
    #[must_use]
    pub fn with_inbound_transform(
        mut self,
        transform: impl Fn(Bytes) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.inbound_transform = Some(Arc::new(transform));
        self
    }
}

impl fmt::Debug for GroupExtensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupExtensions")
            .field("close_data", &self.close_data)
            .field("close_callback", &self.close_callback.is_some())
            .field("inbound_transform", &self.inbound_transform.is_some())
            .finish()
    }
}

/// Pump-side hooks, shared with a [`StandaloneConnection`](crate::standalone::StandaloneConnection)
/// so they can be replaced while the connection runs.
#[derive(Default)]
pub(crate) struct Hooks {
    inner: RwLock<GroupExtensions>,
    fired: AtomicBool,
}

impl Hooks {
    pub(crate) fn new(extensions: GroupExtensions) -> Self {
        Self {
            inner: RwLock::new(extensions),
            fired: AtomicBool::new(false),
        }
    }

    /// Run the inbound transform, if any.
    pub(crate) fn transform(&self, payload: Bytes) -> Option<Bytes> {
        let transform = self.inner.read().inbound_transform.clone();
        match transform {
            Some(transform) => transform(payload),
            None => Some(payload),
        }
    }

    pub(crate) fn set_inbound_transform(&self, transform: InboundTransform) {
        self.inner.write().inbound_transform = Some(transform);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.inner.write().close_callback = Some(callback);
    }

    pub(crate) fn set_close_data(&self, data: Value) {
        self.inner.write().close_data = Some(data);
    }

    /// Spawn the close callback with its payload. Fires at most once per
    /// connection; later calls are no-ops.
    pub(crate) fn notify_closed(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let (callback, data) = {
            let inner = self.inner.read();
            (inner.close_callback.clone(), inner.close_data.clone())
        };
        if let Some(callback) = callback {
            let data = data.unwrap_or(Value::Null);
            drop(tokio::spawn(async move { callback(data) }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn member_ids_are_unique_and_prefixed() {
        let a = MemberId::new();
        let b = MemberId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("member_"));
    }

    #[test]
    fn transform_defaults_to_identity() {
        let hooks = Hooks::default();
        let out = hooks.transform(Bytes::from_static(b"x"));
        assert_eq!(out, Some(Bytes::from_static(b"x")));
    }

    #[test]
    fn transform_can_rewrite_and_drop() {
        let ext = GroupExtensions::default().with_inbound_transform(|b| {
            if b.is_empty() {
                None
            } else {
                Some(Bytes::from(b.to_ascii_uppercase()))
            }
        });
        let hooks = Hooks::new(ext);
        assert_eq!(hooks.transform(Bytes::from_static(b"hi")), Some(Bytes::from_static(b"HI")));
        assert_eq!(hooks.transform(Bytes::new()), None);
    }

    #[test]
    fn late_transform_replaces_earlier() {
        let hooks = Hooks::default();
        hooks.set_inbound_transform(Arc::new(|_| None));
        assert_eq!(hooks.transform(Bytes::from_static(b"x")), None);
    }

    #[tokio::test]
    async fn close_callback_receives_data_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        let counter = calls.clone();
        let ext = GroupExtensions::default()
            .with_close_data(json!({"user": "ada"}))
            .with_close_callback(move |data| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(data);
                }
            });
        let hooks = Hooks::new(ext);
        hooks.notify_closed();
        hooks.notify_closed();

        let data = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(data, json!({"user": "ada"}));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_callback_without_data_gets_null() {
        let (tx, rx) = oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        let hooks = Hooks::default();
        hooks.set_close_callback(Arc::new(move |data| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(data);
            }
        }));
        hooks.notify_closed();
        assert_eq!(rx.await.unwrap(), Value::Null);
    }

    #[test]
    fn extensions_debug_hides_closures() {
        let ext = GroupExtensions::default().with_close_callback(|_| {});
        let debug = format!("{ext:?}");
        assert!(debug.contains("close_callback: true"));
        assert!(debug.contains("inbound_transform: false"));
    }
}
