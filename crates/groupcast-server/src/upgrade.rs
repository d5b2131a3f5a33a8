//! WebSocket upgrade parameters and the origin check.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use groupcast_settings::{ConnectionSettings, UpgradeSettings};
use tokio::time::Instant;

use crate::errors::TransportError;

/// Decides whether an upgrade request's `Origin` header is acceptable.
/// Receives `None` when the header is absent.
pub type OriginCheck = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Parameters applied to every WebSocket upgrade.
#[derive(Clone)]
pub struct UpgradeConfig {
    /// Upper bound from the upgrade request until the connection is
    /// running: joined to its group, or started as a standalone pump.
    pub handshake_timeout: Duration,
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Largest accepted inbound message in bytes.
    pub max_message_size: usize,
    /// Origin policy. The default accepts every origin.
    pub origin_check: OriginCheck,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self::from_settings(&UpgradeSettings::default(), &ConnectionSettings::default())
    }
}

impl UpgradeConfig {
    /// Build from settings. An empty origin list allows every origin.
    pub fn from_settings(upgrade: &UpgradeSettings, connection: &ConnectionSettings) -> Self {
        let origin_check = if upgrade.allowed_origins.is_empty() {
            allow_all()
        } else {
            allow_list(upgrade.allowed_origins.clone())
        };
        Self {
            handshake_timeout: upgrade.handshake_timeout(),
            read_buffer_size: upgrade.read_buffer_size,
            write_buffer_size: upgrade.write_buffer_size,
            max_message_size: connection.max_message_size,
            origin_check,
        }
    }

    /// Replace the origin policy.
    #[must_use]
    pub fn with_origin_check(mut self, check: impl Fn(Option<&str>) -> bool + Send + Sync + 'static) -> Self {
        self.origin_check = Arc::new(check);
        self
    }

    /// Reject the request if its origin fails the policy.
    pub fn check_origin(&self, headers: &HeaderMap) -> Result<(), TransportError> {
        let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
        if (self.origin_check)(origin) {
            Ok(())
        } else {
            Err(TransportError::OriginRejected(
                origin.unwrap_or("<none>").to_string(),
            ))
        }
    }

    /// Handshake deadline for a request arriving now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.handshake_timeout
    }

    /// Apply buffer sizes and the read limit to a pending upgrade.
    pub fn apply(&self, upgrade: WebSocketUpgrade) -> WebSocketUpgrade {
        upgrade
            .read_buffer_size(self.read_buffer_size)
            .write_buffer_size(self.write_buffer_size)
            .max_message_size(self.max_message_size)
    }
}

impl fmt::Debug for UpgradeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

/// Accept every origin, including requests without one.
pub fn allow_all() -> OriginCheck {
    Arc::new(|_| true)
}

/// Accept only the listed origins. Requests without an `Origin` header are
/// not browser requests and are accepted.
pub fn allow_list(origins: Vec<String>) -> OriginCheck {
    Arc::new(move |origin| match origin {
        None => true,
        Some(origin) => origins.iter().any(|allowed| allowed.eq_ignore_ascii_case(origin)),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use proptest::prelude::*;

    use super::*;

    fn headers(origin: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(origin) = origin {
            let _ = headers.insert(ORIGIN, HeaderValue::from_static(origin));
        }
        headers
    }

    #[test]
    fn defaults_follow_settings() {
        let cfg = UpgradeConfig::default();
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cfg.read_buffer_size, 1024);
        assert_eq!(cfg.write_buffer_size, 1024);
        assert_eq!(cfg.max_message_size, 512);
    }

    #[test]
    fn default_accepts_any_origin() {
        let cfg = UpgradeConfig::default();
        assert!(cfg.check_origin(&headers(Some("https://anywhere.example"))).is_ok());
        assert!(cfg.check_origin(&headers(None)).is_ok());
    }

    #[test]
    fn allow_list_rejects_unknown_origin() {
        let settings = UpgradeSettings {
            allowed_origins: vec!["https://app.example".into()],
            ..UpgradeSettings::default()
        };
        let cfg = UpgradeConfig::from_settings(&settings, &ConnectionSettings::default());
        assert!(cfg.check_origin(&headers(Some("https://APP.example"))).is_ok());
        let err = cfg
            .check_origin(&headers(Some("https://evil.example")))
            .unwrap_err();
        assert!(matches!(err, TransportError::OriginRejected(o) if o == "https://evil.example"));
    }

    #[test]
    fn custom_check_replaces_policy() {
        let cfg = UpgradeConfig::default().with_origin_check(|origin| origin.is_some());
        assert!(cfg.check_origin(&headers(None)).is_err());
        assert!(cfg.check_origin(&headers(Some("https://x.example"))).is_ok());
    }

    #[test]
    fn debug_omits_closure() {
        let debug = format!("{:?}", UpgradeConfig::default());
        assert!(debug.contains("max_message_size: 512"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_follows_handshake_timeout() {
        let cfg = UpgradeConfig {
            handshake_timeout: Duration::from_secs(3),
            ..UpgradeConfig::default()
        };
        let now = Instant::now();
        assert_eq!(cfg.deadline() - now, Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn allow_list_ignores_ascii_case(host in "[a-z]{1,12}", other in "[a-z]{1,12}") {
            let allowed = format!("https://{host}.example");
            let check = allow_list(vec![allowed.clone()]);
            prop_assert!(check(Some(&allowed.to_uppercase())));
            prop_assert_eq!(check(Some(&format!("https://{other}.example"))), host == other);
        }
    }
}
