//! # groupcast
//!
//! Demo server: serves `/ws/{group}` with the configured distribution
//! topology and publishes a heartbeat to one group on a fixed interval.
//!
//! The broker is in-memory, so remote topologies fan out between listeners
//! of this one process only. `--instances 2 --topology shared` starts two
//! listeners on consecutive ports sharing one broker; a client of either
//! receives the heartbeats of both.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use groupcast_broker::{Broker, MemoryBroker};
use groupcast_server::GroupcastServer;
use groupcast_settings::{GroupcastSettings, Topology};
use tracing::{info, warn};

/// groupcast demo server.
#[derive(Parser, Debug)]
#[command(name = "groupcast", about = "Group broadcast over WebSocket")]
struct Cli {
    /// Settings file (defaults to `~/.groupcast/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Distribution topology: `local`, `per_group` or `shared`.
    #[arg(long, value_parser = parse_topology)]
    topology: Option<Topology>,

    /// Broker topic prefix for remote topologies.
    #[arg(long)]
    label: Option<String>,

    /// Group that receives the heartbeat.
    #[arg(long, default_value = "demo")]
    group: String,

    /// Seconds between heartbeats, 0 disables them.
    #[arg(long, default_value = "5")]
    interval: u64,

    /// Listeners to start, on consecutive ports, sharing one broker.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..=16))]
    instances: u16,

    /// Emit JSON log lines instead of compact text.
    #[arg(long)]
    json_logs: bool,
}

fn parse_topology(val: &str) -> std::result::Result<Topology, String> {
    Topology::parse(val).ok_or_else(|| format!("unknown topology: {val}"))
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut GroupcastSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(topology) = self.topology {
            settings.group.topology = topology;
        }
        if self.label.is_some() {
            settings.group.label.clone_from(&self.label);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<GroupcastSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(groupcast_settings::settings_path);
    let mut settings = groupcast_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings
        .validate()
        .context("Invalid settings after command-line overrides")?;
    Ok(settings)
}

/// Settings for listener `index`: consecutive ports unless auto-assigned.
fn instance_settings(settings: &GroupcastSettings, index: u16) -> Result<GroupcastSettings> {
    let mut instance = settings.clone();
    if settings.server.port != 0 {
        instance.server.port = settings
            .server
            .port
            .checked_add(index)
            .with_context(|| format!("No port left for instance {index}"))?;
    }
    Ok(instance)
}

/// Listeners sharing one in-memory broker (remote topologies only).
struct Instances {
    servers: Vec<GroupcastServer>,
    broker: Option<Arc<MemoryBroker>>,
}

fn build_instances(settings: &GroupcastSettings, count: u16) -> Result<Instances> {
    let broker = match settings.group.topology {
        Topology::Local => None,
        Topology::PerGroup | Topology::Shared => Some(Arc::new(MemoryBroker::new())),
    };
    let mut servers = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        let shared = broker.clone().map(|b| b as Arc<dyn Broker>);
        let server = GroupcastServer::new(instance_settings(settings, index)?, shared)
            .with_context(|| format!("Failed to build server instance {index}"))?;
        servers.push(server);
    }
    Ok(Instances { servers, broker })
}

/// Publish `heartbeat <n> from <addr>` to `group` until shutdown.
fn spawn_heartbeat(server: &GroupcastServer, group: String, period: Duration, addr: SocketAddr) {
    let manager = server.manager().clone();
    let token = server.shutdown().token();
    server.shutdown().track(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut beat: u64 = 0;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    beat += 1;
                    let payload = format!("heartbeat {beat} from {addr}");
                    if let Err(error) = manager.send_message(&group, payload).await {
                        warn!(group = %group, error = %error, "heartbeat failed");
                    }
                }
            }
        }
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    if settings.logging.json {
        groupcast_logging::init_json_subscriber(&settings.logging.level);
    } else {
        groupcast_logging::init_subscriber(&settings.logging.level);
    }

    let topology = settings.group.topology;
    let Instances { servers, broker } = build_instances(&settings, cli.instances)?;
    let metrics = match groupcast_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(error = %error, "metrics recorder unavailable");
            None
        }
    };
    // The recorder is process-wide; every listener renders the same handle.
    let servers: Vec<_> = servers
        .into_iter()
        .map(|server| match &metrics {
            Some(handle) => server.with_metrics(handle.clone()),
            None => server,
        })
        .collect();

    let mut handles = Vec::with_capacity(servers.len());
    for server in &servers {
        let (addr, handle) = server.listen().await.context("Failed to bind server")?;
        info!("groupcast listening on ws://{addr}/ws/{{group}} ({topology:?})");
        if cli.interval > 0 {
            spawn_heartbeat(server, cli.group.clone(), Duration::from_secs(cli.interval), addr);
        }
        handles.push(handle);
    }

    if let Some(first) = servers.first() {
        first.shutdown().shutdown_on_ctrl_c().await;
    }
    for server in &servers {
        server.shutdown().graceful_shutdown(None).await;
    }
    for handle in handles {
        let _ = handle.await;
    }
    if let Some(broker) = broker {
        broker.shutdown();
    }

    info!("shutdown complete");
    Ok(())
}
