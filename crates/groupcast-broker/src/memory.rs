//! In-process broker backed by a `tokio::sync::broadcast` bus.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{BrokerError, Result};
use crate::pattern::glob_match;
use crate::{Broker, BrokerMessage, Subscription};

/// Default bus capacity. Subscribers lagging further behind lose messages.
const DEFAULT_CAPACITY: usize = 4096;

/// Injected failures, consumed one per call.
#[derive(Default)]
struct Faults {
    failing_subscribes: u32,
    failing_publishes: u32,
}

/// In-process publish/subscribe broker.
///
/// Every subscription sees every message published after it was confirmed,
/// filtered by its glob pattern. A subscriber that falls more than the bus
/// capacity behind skips the overflow, matching the at-least-once-at-best
/// contract of an external broker.
pub struct MemoryBroker {
    bus: broadcast::Sender<BrokerMessage>,
    /// Cancelled to sever every live subscription (simulated connection loss).
    epoch: Mutex<CancellationToken>,
    faults: Mutex<Faults>,
    published: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker with the default bus capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with an explicit bus capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            bus,
            epoch: Mutex::new(CancellationToken::new()),
            faults: Mutex::new(Faults::default()),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Make the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.faults.lock().failing_subscribes = n;
    }

    /// Make the next `n` publish calls fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.faults.lock().failing_publishes = n;
    }

    /// End every live subscription stream, as if the broker connection dropped.
    pub fn drop_subscriptions(&self) {
        let mut epoch = self.epoch.lock();
        epoch.cancel();
        *epoch = CancellationToken::new();
    }

    /// Shut the broker down: live subscriptions end and every later call
    /// fails with [`BrokerError::Unavailable`].
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.drop_subscriptions();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(BrokerError::Unavailable("memory broker shut down".into()));
        }
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }

    /// Total messages accepted by `publish`.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        if Self::take_fault(&mut self.faults.lock().failing_publishes) {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }
        let _ = self.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the broker keeps no history.
        let _ = self.bus.send(BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.ensure_open()?;
        if Self::take_fault(&mut self.faults.lock().failing_subscribes) {
            return Err(BrokerError::Subscribe {
                pattern: pattern.to_string(),
                reason: "injected failure".into(),
            });
        }

        let epoch = self.epoch.lock().clone();
        let pattern = pattern.to_string();
        debug!(pattern = %pattern, "memory broker subscription confirmed");

        let stream = BroadcastStream::new(self.bus.subscribe())
            .filter_map(move |item| {
                let delivered = match item {
                    Ok(msg) if glob_match(&pattern, &msg.topic) => Some(msg),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "subscriber lagged, messages skipped");
                        None
                    }
                };
                futures::future::ready(delivered)
            })
            .take_until(epoch.cancelled_owned());

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next(sub: &mut Subscription) -> Option<BrokerMessage> {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let broker = MemoryBroker::new();
        let mut chat = broker.subscribe("g:chat").await.unwrap();
        let mut all = broker.subscribe("g:*").await.unwrap();
        let mut other = broker.subscribe("h:*").await.unwrap();

        broker.publish("g:chat", Bytes::from_static(b"hi")).await.unwrap();

        let msg = next(&mut chat).await.unwrap();
        assert_eq!(msg.topic, "g:chat");
        assert_eq!(msg.payload, Bytes::from_static(b"hi"));
        assert_eq!(next(&mut all).await.unwrap().topic, "g:chat");

        broker.publish("h:x", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(next(&mut other).await.unwrap().topic, "h:x");
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let broker = MemoryBroker::new();
        broker.publish("nobody", Bytes::new()).await.unwrap();
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn no_history_for_late_subscribers() {
        let broker = MemoryBroker::new();
        broker.publish("g:chat", Bytes::from_static(b"early")).await.unwrap();
        let mut sub = broker.subscribe("g:*").await.unwrap();
        broker.publish("g:chat", Bytes::from_static(b"late")).await.unwrap();
        assert_eq!(next(&mut sub).await.unwrap().payload, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn injected_subscribe_failures_are_consumed() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribes(2);
        assert!(broker.subscribe("g:*").await.is_err());
        assert!(broker.subscribe("g:*").await.is_err());
        assert!(broker.subscribe("g:*").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_ends_streams_and_refuses_calls() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("g:*").await.unwrap();
        broker.shutdown();
        assert!(broker.is_shut_down());
        assert!(next(&mut sub).await.is_none());

        let err = broker.publish("g:chat", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        let err = broker.subscribe("g:*").await.err().unwrap();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn injected_publish_failure() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let err = broker.publish("g:chat", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish { .. }));
        broker.publish("g:chat", Bytes::new()).await.unwrap();
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn drop_subscriptions_ends_streams() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("g:*").await.unwrap();
        broker.drop_subscriptions();
        assert!(next(&mut sub).await.is_none());

        // New subscriptions work after the drop.
        let mut fresh = broker.subscribe("g:*").await.unwrap();
        broker.publish("g:a", Bytes::from_static(b"1")).await.unwrap();
        assert!(next(&mut fresh).await.is_some());
    }

    #[tokio::test]
    async fn subscriber_count_tracks_streams() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.subscriber_count(), 0);
        let sub = broker.subscribe("g:*").await.unwrap();
        assert_eq!(broker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
