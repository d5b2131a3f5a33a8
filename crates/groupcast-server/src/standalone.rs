//! Connections that belong to no group.
//!
//! Inbound messages go through the optional transform and are queued back to
//! the same connection. The owner can push messages with
//! [`StandaloneConnection::send`] and swap hooks while the connection runs.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use groupcast_settings::ConnectionSettings;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::connection::{CloseHandle, Connection};
use crate::errors::{Result, TransportError};
use crate::member::{GroupExtensions, Hooks, MemberId};
use crate::pump::{LiveConnections, Pump, PumpConfig, Route};
use crate::upgrade::UpgradeConfig;

/// Parameters for standalone connections.
#[derive(Clone, Debug)]
pub struct StandaloneConfig {
    /// Upgrade parameters.
    pub upgrade: UpgradeConfig,
    /// Pump timing and limits.
    pub pump: PumpConfig,
    /// Outbound queue length.
    pub queue_length: usize,
    pub(crate) live: LiveConnections,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            upgrade: UpgradeConfig::default(),
            pump: PumpConfig::default(),
            queue_length: ConnectionSettings::default().standalone_queue_length,
            live: LiveConnections::default(),
        }
    }
}

/// Handle to a running standalone connection.
#[derive(Clone)]
pub struct StandaloneConnection {
    id: MemberId,
    outbound: mpsc::Sender<Bytes>,
    hooks: Arc<Hooks>,
    close: CloseHandle,
}

impl StandaloneConnection {
    /// Start pumping an established connection.
    pub fn spawn(connection: Connection, config: &StandaloneConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_length.max(1));
        let hooks = Arc::new(Hooks::new(GroupExtensions::default()));
        let close = CloseHandle::new();
        let id = MemberId::new();
        Pump {
            id,
            connection,
            outbound: rx,
            route: Route::Echo(tx.clone()),
            hooks: hooks.clone(),
            close: close.clone(),
            config: config.pump,
            live: config.live.clone(),
        }
        .spawn();
        Self {
            id,
            outbound: tx,
            hooks,
            close,
        }
    }

    /// Upgrade the request and hand the running connection to `on_open`.
    pub fn accept<F, Fut>(
        upgrade: WebSocketUpgrade,
        headers: &HeaderMap,
        config: &StandaloneConfig,
        on_open: F,
    ) -> Result<Response>
    where
        F: FnOnce(StandaloneConnection) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        config.upgrade.check_origin(headers)?;
        let deadline = config.upgrade.deadline();
        let config = config.clone();
        Ok(config.upgrade.apply(upgrade).on_upgrade(move |socket| async move {
            if tokio::time::Instant::now() >= deadline {
                warn!("handshake timed out before the connection started");
                return;
            }
            let conn = Self::spawn(Connection::from_websocket(socket), &config);
            on_open(conn).await;
        }))
    }

    /// Connection id.
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Replace the inbound transform.
    pub fn set_inbound_transform(&self, transform: impl Fn(Bytes) -> Option<Bytes> + Send + Sync + 'static) {
        self.hooks.set_inbound_transform(Arc::new(transform));
    }

    /// Replace the close callback.
    pub fn set_close_callback(&self, callback: impl Fn(Value) + Send + Sync + 'static) {
        self.hooks.set_close_callback(Arc::new(callback));
    }

    /// Payload passed to the close callback.
    pub fn set_associated_data(&self, data: Value) {
        self.hooks.set_close_data(data);
    }

    /// Queue a message for this connection, waiting while the queue is full.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.close.is_closed() {
            return Err(TransportError::Closed.into());
        }
        self.outbound
            .send(payload.into())
            .await
            .map_err(|_| TransportError::Closed.into())
    }

    /// Request the connection to close. Never blocks.
    pub fn close(&self) {
        self.close.close();
    }

    /// Whether the connection is closed or closing.
    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}
