//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GroupcastSettings::default()`]
//! 2. If `~/.groupcast/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `GROUPCAST_*` environment variable overrides (highest priority)
//! 4. Validate cross-field invariants
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{GroupcastSettings, Topology};

/// Resolve the path to the settings file (`~/.groupcast/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".groupcast").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GroupcastSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or values that fail
/// validation return an error.
pub fn load_settings_from_path(path: &Path) -> Result<GroupcastSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Read and merge the settings file without consulting the environment.
pub fn read_settings_file(path: &Path) -> Result<GroupcastSettings> {
    let defaults = serde_json::to_value(GroupcastSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut GroupcastSettings) {
    apply_overrides(settings, |name| {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    });
}

/// Apply overrides from an arbitrary lookup (env vars in production, a map in tests).
pub fn apply_overrides(settings: &mut GroupcastSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read_u64 = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = lookup("GROUPCAST_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_u64("GROUPCAST_PORT", 0, 65_535) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = read_u64("GROUPCAST_WRITE_WAIT_MS", 1, 600_000) {
        settings.connection.write_wait_ms = v;
    }
    if let Some(v) = read_u64("GROUPCAST_PONG_WAIT_MS", 1, 3_600_000) {
        settings.connection.pong_wait_ms = v;
        // keep the canonical 9:10 ratio unless the period is set explicitly
        settings.connection.ping_period_ms = v * 9 / 10;
    }
    if let Some(v) = read_u64("GROUPCAST_PING_PERIOD_MS", 1, 3_600_000) {
        settings.connection.ping_period_ms = v;
    }
    if let Some(v) = read_u64("GROUPCAST_MAX_MESSAGE_SIZE", 1, 64 * 1024 * 1024) {
        settings.connection.max_message_size = usize::try_from(v).unwrap_or(usize::MAX);
    }

    // ── Group ───────────────────────────────────────────────────────
    if let Some(v) = read_u64("GROUPCAST_MAX_QUEUE_LENGTH", 1, 1_000_000) {
        settings.group.max_queue_length = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = lookup("GROUPCAST_TOPOLOGY") {
        match Topology::parse(&v) {
            Some(t) => settings.group.topology = t,
            None => tracing::warn!(key = "GROUPCAST_TOPOLOGY", value = %v, "unknown topology, ignoring"),
        }
    }
    if let Some(v) = lookup("GROUPCAST_LABEL") {
        settings.group.label = Some(v);
    }
    if let Some(v) = read_u64("GROUPCAST_RELAY_RETRY_MS", 1, 600_000) {
        settings.group.relay_retry_delay_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = lookup("GROUPCAST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = lookup("GROUPCAST_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => tracing::warn!(key = "GROUPCAST_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
