//! Settings types with compiled defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupcastSettings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// Per-connection pump timing and limits.
    pub connection: ConnectionSettings,
    /// Group hub sizing and distribution topology.
    pub group: GroupSettings,
    /// WebSocket upgrade parameters.
    pub upgrade: UpgradeSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GroupcastSettings {
    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.group.validate()?;
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Connection pump settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Time allowed to write one frame to the peer, in milliseconds.
    pub write_wait_ms: u64,
    /// Time allowed between pongs before the peer is considered dead.
    pub pong_wait_ms: u64,
    /// Keepalive ping period. Must be shorter than `pong_wait_ms`.
    pub ping_period_ms: u64,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue length for standalone (non-grouped) connections.
    pub standalone_queue_length: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let pong_wait_ms = 60_000;
        Self {
            write_wait_ms: 10_000,
            pong_wait_ms,
            ping_period_ms: pong_wait_ms * 9 / 10,
            max_message_size: 512,
            standalone_queue_length: 256,
        }
    }
}

impl ConnectionSettings {
    /// Write deadline per frame.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Read deadline, refreshed on every pong.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Keepalive ping period.
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.ping_period_ms == 0 || self.ping_period_ms >= self.pong_wait_ms {
            return Err(SettingsError::InvalidValue(format!(
                "connection.pingPeriodMs ({}) must be non-zero and below connection.pongWaitMs ({})",
                self.ping_period_ms, self.pong_wait_ms
            )));
        }
        if self.write_wait_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.writeWaitMs must be non-zero".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.maxMessageSize must be non-zero".into(),
            ));
        }
        if self.standalone_queue_length == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.standaloneQueueLength must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// How group traffic reaches other server processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// No cross-process fan-out.
    #[default]
    Local,
    /// One broker subscription per group.
    PerGroup,
    /// One pattern subscription shared by all groups.
    Shared,
}

impl Topology {
    /// Parse a topology name as used on the command line and in env vars.
    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "per_group" | "per-group" | "pergroup" => Some(Self::PerGroup),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Group hub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSettings {
    /// Hub event queue length. Member outbound queues get three times this.
    pub max_queue_length: usize,
    /// Distribution topology.
    pub topology: Topology,
    /// Broker topic prefix. `None` selects the topology's default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Fixed delay between broker subscription attempts, in milliseconds.
    pub relay_retry_delay_ms: u64,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            max_queue_length: 1000,
            topology: Topology::Local,
            label: None,
            relay_retry_delay_ms: 100,
        }
    }
}

impl GroupSettings {
    /// Delay between relay subscription attempts.
    pub fn relay_retry_delay(&self) -> Duration {
        Duration::from_millis(self.relay_retry_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_queue_length == 0 {
            return Err(SettingsError::InvalidValue(
                "group.maxQueueLength must be non-zero".into(),
            ));
        }
        if self.label.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return Err(SettingsError::InvalidValue(
                "group.label cannot be empty or blank".into(),
            ));
        }
        Ok(())
    }
}

/// WebSocket upgrade settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeSettings {
    /// Upper bound on the upgrade request, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Allowed `Origin` header values. Empty allows every origin.
    pub allowed_origins: Vec<String>,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            allowed_origins: Vec::new(),
        }
    }
}

impl UpgradeSettings {
    /// Handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = GroupcastSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.connection.write_wait(), Duration::from_secs(10));
        assert_eq!(settings.connection.pong_wait(), Duration::from_secs(60));
        assert_eq!(settings.connection.ping_period(), Duration::from_secs(54));
        assert_eq!(settings.connection.max_message_size, 512);
        assert_eq!(settings.group.max_queue_length, 1000);
        assert_eq!(settings.group.topology, Topology::Local);
        assert_eq!(settings.upgrade.read_buffer_size, 1024);
    }

    #[test]
    fn ping_period_must_be_below_pong_wait() {
        let mut settings = GroupcastSettings::default();
        settings.connection.ping_period_ms = settings.connection.pong_wait_ms;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("pingPeriodMs"));
    }

    #[test]
    fn zero_queue_length_rejected() {
        let mut settings = GroupcastSettings::default();
        settings.group.max_queue_length = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn blank_label_rejected() {
        let mut settings = GroupcastSettings::default();
        settings.group.label = Some("   ".into());
        assert!(settings.validate().is_err());
        settings.group.label = Some("chat_".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn topology_parse() {
        assert_eq!(Topology::parse("local"), Some(Topology::Local));
        assert_eq!(Topology::parse("Per-Group"), Some(Topology::PerGroup));
        assert_eq!(Topology::parse("shared"), Some(Topology::Shared));
        assert_eq!(Topology::parse("redis"), None);
    }

    #[test]
    fn topology_serde_names() {
        let json = serde_json::to_string(&Topology::PerGroup).unwrap();
        assert_eq!(json, "\"per_group\"");
        let back: Topology = serde_json::from_str("\"shared\"").unwrap();
        assert_eq!(back, Topology::Shared);
    }
}
