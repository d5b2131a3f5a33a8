//! `GroupcastServer`: axum HTTP + WebSocket glue around a [`GroupManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use groupcast_broker::Broker;
use groupcast_settings::GroupcastSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::distribution::Distribution;
use crate::errors::Result;
use crate::health::{self, HealthResponse};
use crate::manager::{GroupManager, ManagerConfig};
use crate::shutdown::ShutdownCoordinator;
use crate::standalone::StandaloneConnection;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Group manager.
    pub manager: Arc<GroupManager>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The groupcast HTTP server.
pub struct GroupcastServer {
    settings: GroupcastSettings,
    manager: Arc<GroupManager>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl GroupcastServer {
    /// Create a server for `settings`. Remote topologies need a broker.
    pub fn new(settings: GroupcastSettings, broker: Option<Arc<dyn Broker>>) -> Result<Self> {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let distribution = Distribution::from_settings(&settings.group, broker)?;
        let manager = GroupManager::new(
            ManagerConfig::from_settings(&settings),
            distribution,
            shutdown.token(),
        )?;
        Ok(Self {
            settings,
            manager,
            shutdown,
            start_time: Instant::now(),
            metrics: None,
        })
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    ///
    /// WebSocket routes read the manager's upgrade config per request, so
    /// [`GroupManager::set_upgrade_config`] applies to the next handshake.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(standalone_handler))
            .route("/ws/{group}", get(group_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind to the configured address and serve in a background task until
    /// the shutdown coordinator fires. Port `0` picks a free port.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let bind = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        info!(%addr, topology = ?self.manager.topology(), "groupcast server listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            match served {
                Ok(()) => info!("groupcast server stopped"),
                Err(error) => warn!(error = %error, "groupcast server failed"),
            }
        });
        Ok((addr, handle))
    }

    /// Get the group manager.
    pub fn manager(&self) -> &Arc<GroupManager> {
        &self.manager
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the settings the server was built from.
    pub fn settings(&self) -> &GroupcastSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.manager;
    Json(health::health_check(
        state.start_time,
        manager.topology(),
        manager.group_count(),
        manager.connection_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws/{group}: upgrade and join the named group.
async fn group_handler(
    State(state): State<AppState>,
    Path(group): Path<String>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    match state.manager.add_group(&group, upgrade, &headers) {
        Ok(response) => response,
        Err(error) => {
            debug!(group = %group, error = %error, "group upgrade rejected");
            error.into_response()
        }
    }
}

/// GET /ws: upgrade into a standalone echo connection.
async fn standalone_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let config = state.manager.standalone_config();
    match StandaloneConnection::accept(upgrade, &headers, &config, |conn| async move {
        debug!(connection = %conn.id(), "standalone connection opened");
    }) {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}
