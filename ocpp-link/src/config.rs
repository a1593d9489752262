//! Configuration for charge point links
//!
//! The WebSocket base URL and bearer token are injected here rather than read
//! from shared mutable state, so a connection depends only on its config.

use std::time::Duration;

use crate::ocpp::OcppError;

/// Environment variable holding the WebSocket base URL
pub const ENV_WS_BASE_URL: &str = "OCPP_WS_BASE_URL";

/// Environment variable holding the bearer token
pub const ENV_AUTH_TOKEN: &str = "OCPP_AUTH_TOKEN";

/// Link configuration shared by every connection of a registry
#[derive(Debug, Clone)]
pub struct OcppConfig {
    /// WebSocket base URL; the charge point ID is appended as a path segment
    pub ws_base_url: Option<String>,

    /// Sent as `Authorization: Bearer {token}` when present
    pub auth_token: Option<String>,

    /// Deadline for each outbound CALL
    pub request_timeout: Duration,

    /// Interval between outbound Heartbeat calls while connected
    pub heartbeat_interval: Duration,

    /// Fixed wait before each automatic reconnect attempt
    pub reconnect_delay: Duration,

    /// Automatic reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            ws_base_url: None,
            auth_token: None,
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            event_capacity: 256,
        }
    }
}

impl OcppConfig {
    /// Create config with a base URL
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: Some(ws_base_url.into()),
            ..Default::default()
        }
    }

    /// Read `OCPP_WS_BASE_URL` and `OCPP_AUTH_TOKEN`, keeping defaults for the rest
    ///
    /// A missing URL is not an error here; it surfaces when a connection is opened.
    pub fn from_env() -> Self {
        Self {
            ws_base_url: non_empty_env(ENV_WS_BASE_URL),
            auth_token: non_empty_env(ENV_AUTH_TOKEN),
            ..Default::default()
        }
    }

    /// Set bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set reconnect delay and attempt budget
    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Full WebSocket URL for a charge point
    pub fn connection_url(&self, charge_point_id: &str) -> Result<String, OcppError> {
        let base = self
            .ws_base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                OcppError::Config(format!("{} is not configured", ENV_WS_BASE_URL))
            })?;

        Ok(build_ocpp_url(base, charge_point_id))
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, charge_point_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("wss://csms.example.com/ocpp", "CP1");
        assert_eq!(url, "wss://csms.example.com/ocpp/CP1");

        let url = build_ocpp_url("wss://csms.example.com/ocpp/", "CP1");
        assert_eq!(url, "wss://csms.example.com/ocpp/CP1");
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let config = OcppConfig::default();
        assert!(matches!(
            config.connection_url("CP1"),
            Err(OcppError::Config(_))
        ));

        let config = OcppConfig::new("   ");
        assert!(matches!(
            config.connection_url("CP1"),
            Err(OcppError::Config(_))
        ));
    }

    #[test]
    fn test_config_builder() {
        let config = OcppConfig::new("ws://localhost:9000")
            .with_auth_token("secret")
            .with_request_timeout(Duration::from_secs(5))
            .with_reconnect(Duration::from_millis(100), 3);

        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.connection_url("CP7").unwrap(), "ws://localhost:9000/CP7");
    }

    #[test]
    fn test_defaults() {
        let config = OcppConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 10);
    }
}
