//! Connection pump: the read and write loops bridging one connection to a
//! hub (grouped) or to its own outbound queue (echo).
//!
//! Teardown is owned by the receive loop and runs exactly once: unregister
//! from the group, fire the close notification, request close. The send loop
//! closes the physical sink exactly once and then signals the receive loop
//! through the shared close handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use groupcast_settings::ConnectionSettings;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{CloseHandle, Connection, Frame, FrameSink, FrameStream};
use crate::distribution::DistributionStrategy;
use crate::errors::TransportError;
use crate::hub::Group;
use crate::member::{Hooks, MemberId};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL, OVERSIZED_MESSAGES_TOTAL,
    PUBLISH_FAILURES_TOTAL,
};

/// Timing and limits applied to every pump.
#[derive(Clone, Copy, Debug)]
pub struct PumpConfig {
    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// Read deadline, refreshed on every pong.
    pub pong_wait: Duration,
    /// Keepalive ping period.
    pub ping_period: Duration,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for PumpConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            write_wait: settings.write_wait(),
            pong_wait: settings.pong_wait(),
            ping_period: settings.ping_period(),
            max_message_size: settings.max_message_size,
        }
    }
}

/// Where inbound messages go.
pub(crate) enum Route {
    Group {
        group: Group,
        member: MemberId,
        distribution: Arc<dyn DistributionStrategy>,
    },
    Echo(mpsc::Sender<Bytes>),
}

impl Route {
    fn mode(&self) -> &'static str {
        match self {
            Self::Group { .. } => "group",
            Self::Echo(_) => "standalone",
        }
    }
}

/// Live connection counter shared by every pump of one manager.
#[derive(Clone, Debug, Default)]
pub(crate) struct LiveConnections(Arc<AtomicUsize>);

impl LiveConnections {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn enter(&self, mode: &'static str) -> LiveGuard {
        let _ = self.0.fetch_add(1, Ordering::Relaxed);
        counter!(CONNECTIONS_TOTAL, "mode" => mode).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        LiveGuard {
            live: self.clone(),
            mode,
        }
    }
}

struct LiveGuard {
    live: LiveConnections,
    mode: &'static str,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let _ = self.live.0.fetch_sub(1, Ordering::Relaxed);
        counter!(DISCONNECTIONS_TOTAL, "mode" => self.mode).increment(1);
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// Everything one pump needs.
pub(crate) struct Pump {
    pub(crate) id: MemberId,
    pub(crate) connection: Connection,
    pub(crate) outbound: mpsc::Receiver<Bytes>,
    pub(crate) route: Route,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) close: CloseHandle,
    pub(crate) config: PumpConfig,
    pub(crate) live: LiveConnections,
}

impl Pump {
    /// Start both loops.
    pub(crate) fn spawn(self) {
        let Self {
            id,
            connection,
            outbound,
            route,
            hooks,
            close,
            config,
            live,
        } = self;
        let (sink, stream) = connection.into_parts();
        let guard = live.enter(route.mode());
        info!(connection = %id, mode = route.mode(), "connection opened");

        drop(tokio::spawn(send_loop(sink, outbound, close.clone(), config)));
        drop(tokio::spawn(async move {
            let reader = Reader {
                id,
                route,
                hooks,
                close,
                config,
            };
            reader.run(stream).await;
            drop(guard);
        }));
    }
}

struct Reader {
    id: MemberId,
    route: Route,
    hooks: Arc<Hooks>,
    close: CloseHandle,
    config: PumpConfig,
}

impl Reader {
    async fn run(self, mut stream: FrameStream) {
        let outcome = self.receive(&mut stream).await;
        match &outcome {
            Ok(()) => info!(connection = %self.id, "connection closed"),
            Err(error) => info!(connection = %self.id, error = %error, "connection closed"),
        }
        self.teardown().await;
    }

    async fn receive(&self, stream: &mut FrameStream) -> Result<(), TransportError> {
        let mut deadline = Instant::now() + self.config.pong_wait;
        loop {
            let next = tokio::select! {
                () = self.close.closed() => return Ok(()),
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => return Err(TransportError::ReadTimeout),
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame?,
            };
            match frame {
                Frame::Pong(_) => deadline = Instant::now() + self.config.pong_wait,
                Frame::Ping(_) => {}
                Frame::Close => return Ok(()),
                Frame::Message(payload) => {
                    if payload.len() > self.config.max_message_size {
                        counter!(OVERSIZED_MESSAGES_TOTAL).increment(1);
                        return Err(TransportError::MessageTooLarge {
                            size: payload.len(),
                            limit: self.config.max_message_size,
                        });
                    }
                    let Some(payload) = self.hooks.transform(payload) else {
                        continue;
                    };
                    self.dispatch(payload).await?;
                }
            }
        }
    }

    async fn dispatch(&self, payload: Bytes) -> Result<(), TransportError> {
        match &self.route {
            Route::Group {
                group,
                distribution,
                ..
            } => {
                if let Err(error) = distribution.publish(group.name(), payload).await {
                    counter!(PUBLISH_FAILURES_TOTAL).increment(1);
                    warn!(
                        connection = %self.id,
                        group = %group.name(),
                        error = %error,
                        "publish failed, message dropped"
                    );
                }
                Ok(())
            }
            Route::Echo(tx) => tx.send(payload).await.map_err(|_| TransportError::Closed),
        }
    }

    async fn teardown(&self) {
        if let Route::Group { group, member, .. } = &self.route {
            group.unregister(*member).await;
        }
        self.hooks.notify_closed();
        self.close.close();
    }
}

async fn send_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Bytes>,
    close: CloseHandle,
    config: PumpConfig,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result: Result<(), TransportError> = async {
        loop {
            tokio::select! {
                () = close.closed() => {
                    write(&mut sink, Frame::Close, config.write_wait).await?;
                    return Ok(());
                }
                next = outbound.recv() => match next {
                    Some(first) => {
                        let payload = coalesce(first, &mut outbound);
                        write(&mut sink, Frame::Message(payload), config.write_wait).await?;
                    }
                    None => {
                        write(&mut sink, Frame::Close, config.write_wait).await?;
                        return Ok(());
                    }
                },
                _ = ping.tick() => write(&mut sink, Frame::Ping(Bytes::new()), config.write_wait).await?,
            }
        }
    }
    .await;

    if let Err(error) = result {
        debug!(error = %error, "send loop ended");
    }
    close.close();
    let _ = tokio::time::timeout(config.write_wait, sink.close()).await;
}

/// Join `first` with every message already queued, separated by `\n`.
fn coalesce(first: Bytes, outbound: &mut mpsc::Receiver<Bytes>) -> Bytes {
    let queued = outbound.len();
    if queued == 0 {
        return first;
    }
    let mut buf = BytesMut::from(&first[..]);
    for _ in 0..queued {
        match outbound.try_recv() {
            Ok(next) => {
                buf.put_u8(b'\n');
                buf.extend_from_slice(&next);
            }
            Err(_) => break,
        }
    }
    buf.freeze()
}

async fn write(sink: &mut FrameSink, frame: Frame, write_wait: Duration) -> Result<(), TransportError> {
    match tokio::time::timeout(write_wait, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use groupcast_broker::MemoryBroker;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connection::RemotePeer;
    use crate::directory::Directory;
    use crate::distribution::{LocalOnly, PerGroupChannel};
    use crate::member::{GroupExtensions, Member};

    fn config() -> PumpConfig {
        PumpConfig {
            write_wait: Duration::from_millis(200),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_message_size: 512,
        }
    }

    fn echo(config: PumpConfig, ext: GroupExtensions) -> (RemotePeer, CloseHandle, LiveConnections) {
        let (conn, peer) = Connection::loopback();
        let (tx, rx) = mpsc::channel(16);
        let close = CloseHandle::new();
        let live = LiveConnections::default();
        Pump {
            id: MemberId::new(),
            connection: conn,
            outbound: rx,
            route: Route::Echo(tx),
            hooks: Arc::new(Hooks::new(ext)),
            close: close.clone(),
            config,
            live: live.clone(),
        }
        .spawn();
        (peer, close, live)
    }

    async fn grouped(
        dir: &Arc<Directory>,
        distribution: Arc<dyn DistributionStrategy>,
        name: &str,
        ext: GroupExtensions,
    ) -> (RemotePeer, CloseHandle) {
        let (group, created) = dir.get_or_create(name, 16);
        if created {
            distribution.attach(&group);
        }
        let (conn, peer) = Connection::loopback();
        let (tx, rx) = mpsc::channel(16);
        let id = MemberId::new();
        let close = CloseHandle::new();
        group
            .register(Member {
                id,
                outbound: tx,
                close: close.clone(),
            })
            .await
            .unwrap();
        Pump {
            id,
            connection: conn,
            outbound: rx,
            route: Route::Group {
                group,
                member: id,
                distribution,
            },
            hooks: Arc::new(Hooks::new(ext)),
            close: close.clone(),
            config: config(),
            live: LiveConnections::default(),
        }
        .spawn();
        (peer, close)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn echo_mode_returns_messages() {
        let (mut peer, _close, live) = echo(config(), GroupExtensions::default());
        assert!(peer.send_message("ping?"));
        assert_eq!(peer.recv_message().await.unwrap(), Bytes::from_static(b"ping?"));
        assert_eq!(live.get(), 1);
    }

    #[tokio::test]
    async fn inbound_transform_rewrites_and_drops() {
        let ext = GroupExtensions::default().with_inbound_transform(|b| {
            (b.as_ref() != b"drop").then(|| Bytes::from(b.to_ascii_uppercase()))
        });
        let (mut peer, _close, _) = echo(config(), ext);
        assert!(peer.send_message("drop"));
        assert!(peer.send_message("keep"));
        assert_eq!(peer.recv_message().await.unwrap(), Bytes::from_static(b"KEEP"));
    }

    #[tokio::test]
    async fn oversized_message_closes_connection() {
        let (mut peer, close, live) = echo(config(), GroupExtensions::default());
        assert!(peer.send_message(vec![b'x'; 513]));
        assert!(peer.recv_message().await.is_none());
        assert!(close.is_closed());
        wait_until(|| live.get() == 0).await;
    }

    #[tokio::test]
    async fn peer_close_frame_ends_pump() {
        let (mut peer, close, _) = echo(config(), GroupExtensions::default());
        assert!(peer.send(Frame::Close));
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert!(peer.recv().await.is_none());
        assert!(close.is_closed());
    }

    #[tokio::test]
    async fn close_handle_writes_close_frame() {
        let (mut peer, close, _) = echo(config(), GroupExtensions::default());
        close.close();
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_on_schedule() {
        let cfg = PumpConfig {
            ping_period: Duration::from_secs(9),
            pong_wait: Duration::from_secs(10),
            ..config()
        };
        let (mut peer, close, _) = echo(cfg, GroupExtensions::default());
        assert!(matches!(peer.recv().await, Some(Frame::Ping(_))));
        assert!(peer.send(Frame::Pong(Bytes::new())));
        assert!(matches!(peer.recv().await, Some(Frame::Ping(_))));
        assert!(!close.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_hits_read_deadline() {
        let cfg = PumpConfig {
            ping_period: Duration::from_secs(9),
            pong_wait: Duration::from_secs(10),
            ..config()
        };
        let (mut peer, close, _) = echo(cfg, GroupExtensions::default());
        assert!(matches!(peer.recv().await, Some(Frame::Ping(_))));
        // No pong: the deadline passes a second later.
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert!(close.is_closed());
    }

    #[tokio::test]
    async fn stalled_writer_times_out() {
        let (conn, _peer) = Connection::loopback_bounded(1);
        let (tx, rx) = mpsc::channel(16);
        let close = CloseHandle::new();
        Pump {
            id: MemberId::new(),
            connection: conn,
            outbound: rx,
            route: Route::Echo(tx.clone()),
            hooks: Arc::new(Hooks::default()),
            close: close.clone(),
            config: PumpConfig {
                write_wait: Duration::from_millis(20),
                ..config()
            },
            live: LiveConnections::default(),
        }
        .spawn();

        for i in 0..4u8 {
            let _ = tx.send(Bytes::from(vec![i])).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_until(|| close.is_closed()).await;
    }

    #[test]
    fn coalesce_joins_queued_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(Bytes::from_static(b"b")).unwrap();
        tx.try_send(Bytes::from_static(b"c")).unwrap();
        let joined = coalesce(Bytes::from_static(b"a"), &mut rx);
        assert_eq!(joined, Bytes::from_static(b"a\nb\nc"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn coalesce_single_message_is_untouched() {
        let (_tx, mut rx) = mpsc::channel::<Bytes>(8);
        assert_eq!(coalesce(Bytes::from_static(b"solo"), &mut rx), Bytes::from_static(b"solo"));
    }

    #[tokio::test]
    async fn grouped_message_reaches_other_members() {
        let dir = Directory::new();
        let local: Arc<dyn DistributionStrategy> = Arc::new(LocalOnly::new(dir.clone()));
        let (alice, _) = grouped(&dir, local.clone(), "chat", GroupExtensions::default()).await;
        let (mut bob, _) = grouped(&dir, local, "chat", GroupExtensions::default()).await;

        assert!(alice.send_message("hi"));
        assert_eq!(bob.recv_message().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn disconnect_unregisters_and_notifies_once() {
        let dir = Directory::new();
        let local: Arc<dyn DistributionStrategy> = Arc::new(LocalOnly::new(dir.clone()));
        let (tx, mut notified) = mpsc::unbounded_channel();
        let ext = GroupExtensions::default()
            .with_close_data(serde_json::json!("bye"))
            .with_close_callback(move |data| {
                let _ = tx.send(data);
            });
        let (mut leaver, close) = grouped(&dir, local.clone(), "room", ext).await;
        let (_stayer, _) = grouped(&dir, local, "room", GroupExtensions::default()).await;
        let group = dir.get("room").unwrap();
        assert_eq!(group.member_count(), 2);

        leaver.hang_up();
        assert_eq!(notified.recv().await.unwrap(), serde_json::json!("bye"));
        wait_until(|| group.member_count() == 1).await;
        assert!(close.is_closed());
        close.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notified.try_recv().is_err());
    }

    #[tokio::test]
    async fn last_member_leaving_deletes_group() {
        let dir = Directory::new();
        let local: Arc<dyn DistributionStrategy> = Arc::new(LocalOnly::new(dir.clone()));
        let (mut only, _) = grouped(&dir, local, "ephemeral", GroupExtensions::default()).await;
        assert!(dir.get("ephemeral").is_some());
        only.hang_up();
        wait_until(|| dir.get("ephemeral").is_none()).await;
    }

    #[tokio::test]
    async fn per_group_publish_is_out_and_back() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = CancellationToken::new();
        let dir = Directory::new();
        let per_group: Arc<dyn DistributionStrategy> = Arc::new(PerGroupChannel::new(
            broker.clone(),
            "t:".into(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        let (sender, _) = grouped(&dir, per_group.clone(), "chat", GroupExtensions::default()).await;
        let (mut receiver, _) = grouped(&dir, per_group, "chat", GroupExtensions::default()).await;
        wait_until(|| broker.subscriber_count() == 1).await;

        assert!(sender.send_message("via broker"));
        assert_eq!(
            receiver.recv_message().await.unwrap(),
            Bytes::from_static(b"via broker")
        );
        assert_eq!(broker.published_count(), 1);
        shutdown.cancel();
    }
}
