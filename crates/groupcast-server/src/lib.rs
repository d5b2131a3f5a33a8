//! # groupcast-server
//!
//! Named broadcast groups over persistent WebSocket connections.
//!
//! - [`GroupManager`]: join connections to groups, publish to groups
//! - Group hub: one control loop per group owning membership and fan-out
//! - Connection pump: read and write loops per connection, keepalive, eviction
//! - [`distribution`]: local-only, per-group broker channel, or one shared
//!   broker channel for cross-process delivery
//! - [`StandaloneConnection`]: echo connections outside any group
//! - [`GroupcastServer`]: axum router (`/ws/{group}`, `/ws`, `/health`, `/metrics`)
//!   and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod connection;
pub mod directory;
pub mod distribution;
pub mod errors;
pub mod health;
pub mod hub;
pub mod manager;
pub mod member;
pub mod metrics;
pub mod pump;
pub mod server;
pub mod shutdown;
pub mod standalone;
pub mod upgrade;

pub use connection::{CloseHandle, Connection, Frame, RemotePeer};
pub use directory::Directory;
pub use distribution::{Distribution, DistributionStrategy};
pub use errors::{GroupError, Result, TransportError};
pub use hub::Group;
pub use manager::{GroupManager, ManagerConfig};
pub use member::{GroupExtensions, MemberId};
pub use pump::PumpConfig;
pub use server::{AppState, GroupcastServer};
pub use shutdown::ShutdownCoordinator;
pub use standalone::{StandaloneConfig, StandaloneConnection};
pub use upgrade::UpgradeConfig;
