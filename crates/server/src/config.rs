//! Listener and delivery settings
//!
//! Built once from the service configuration at startup and never changed
//! afterwards.

use crate::error::{Result, ServerError};
use std::net::SocketAddr;
use std::time::Duration;

/// Default push port
pub const DEFAULT_PUSH_PORT: u16 = 8765;
/// Default HTTP API port
pub const DEFAULT_API_PORT: u16 = 8080;

/// Where the push server and HTTP API listen. A `None` port disables that
/// listener; port `0` binds an ephemeral port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub push_host: String,
    pub push_port: Option<u16>,
    pub api_host: String,
    pub api_port: Option<u16>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, push_port: u16, api_port: u16) -> Self {
        let host = host.into();
        Self {
            push_host: host.clone(),
            push_port: Some(push_port),
            api_host: host,
            api_port: Some(api_port),
        }
    }

    /// Push server only, no HTTP API
    pub fn push_only(host: impl Into<String>, port: u16) -> Self {
        Self {
            push_host: host.into(),
            push_port: Some(port),
            api_host: String::new(),
            api_port: None,
        }
    }

    pub fn with_api(mut self, host: impl Into<String>, port: u16) -> Self {
        self.api_host = host.into();
        self.api_port = Some(port);
        self
    }

    pub fn push_addr(&self) -> Option<Result<SocketAddr>> {
        self.push_port.map(|p| parse_addr(&self.push_host, p))
    }

    pub fn api_addr(&self) -> Option<Result<SocketAddr>> {
        self.api_port.map(|p| parse_addr(&self.api_host, p))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("0.0.0.0", DEFAULT_PUSH_PORT, DEFAULT_API_PORT)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", host, port)))
}

/// Per-subscriber delivery policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliverySettings {
    /// Messages per frame before an immediate flush
    pub batch_size: usize,
    /// Longest a queued message waits for its batch to fill
    pub flush_delay: Duration,
    /// Bounded outbound queue per subscriber; overflow evicts
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Feed data older than this is reported stale
    pub stale_after: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            flush_delay: Duration::from_millis(10),
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_addresses() {
        let config = ServerConfig::new("127.0.0.1", 8765, 8080);
        assert_eq!(
            config.push_addr().unwrap().unwrap(),
            "127.0.0.1:8765".parse().unwrap()
        );
        assert_eq!(
            config.api_addr().unwrap().unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
    }

    #[test]
    fn test_push_only() {
        let config = ServerConfig::push_only("127.0.0.1", 0);
        assert!(config.api_addr().is_none());

        let config = config.with_api("0.0.0.0", 9000);
        assert_eq!(config.api_port, Some(9000));
    }

    #[test]
    fn test_invalid_host() {
        let config = ServerConfig::push_only("not a host", 8765);
        assert!(matches!(
            config.push_addr(),
            Some(Err(ServerError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_delivery_defaults() {
        let settings = DeliverySettings::default();
        assert_eq!(settings.batch_size, 32);
        assert_eq!(settings.flush_delay, Duration::from_millis(10));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
    }
}
