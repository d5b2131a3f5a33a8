//! # groupcast-settings
//!
//! Configuration for groupcast, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GroupcastSettings::default()`]
//! 2. **User file**: `~/.groupcast/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `GROUPCAST_*` overrides (highest priority)
//!
//! Unlike a process-wide singleton, settings are loaded once by the binary and
//! handed to the components that need them.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    read_settings_file, settings_path,
};
pub use types::{
    ConnectionSettings, GroupSettings, GroupcastSettings, LoggingSettings, ServerSettings,
    Topology, UpgradeSettings,
};
