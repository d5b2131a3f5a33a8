//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections accepted total (counter, labels: mode).
pub const CONNECTIONS_TOTAL: &str = "groupcast_connections_total";
/// Connections closed total (counter, labels: mode).
pub const DISCONNECTIONS_TOTAL: &str = "groupcast_disconnections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "groupcast_connections_active";
/// Live groups (gauge).
pub const GROUPS_ACTIVE: &str = "groupcast_groups_active";
/// Broadcasts processed by hubs (counter).
pub const BROADCASTS_TOTAL: &str = "groupcast_broadcasts_total";
/// Members evicted for a full outbound queue (counter).
pub const EVICTIONS_TOTAL: &str = "groupcast_evictions_total";
/// Failed publishes to the distribution layer (counter).
pub const PUBLISH_FAILURES_TOTAL: &str = "groupcast_publish_failures_total";
/// Relay subscription attempts that failed and were retried (counter, labels: topology).
pub const RELAY_RETRIES_TOTAL: &str = "groupcast_relay_retries_total";
/// Inbound messages rejected for exceeding the read limit (counter).
pub const OVERSIZED_MESSAGES_TOTAL: &str = "groupcast_oversized_messages_total";
