//! Traversal configuration.

use doorstop_discovery::TransportFamily;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default stopper port
pub const DEFAULT_STOPPER_PORT: u16 = 15409;
/// Default STUN server
pub const DEFAULT_STUN_HOST: &str = "stun.l.google.com";
/// Default STUN server port
pub const DEFAULT_STUN_PORT: u16 = 19302;
/// Default local service port (WireGuard)
pub const DEFAULT_LOCAL_PORT: u16 = 51820;
/// Default firewall binary
pub const DEFAULT_FIREWALL: &str = "iptables";
/// Default keep-alive interval
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Everything needed to expose one local UDP service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Address family, reported as the endpoint protocol
    pub transport: TransportFamily,
    /// Local port whose NAT mapping is discovered and kept alive
    pub stopper_port: u16,
    /// STUN server host
    pub stun_host: String,
    /// STUN server port
    pub stun_port: u16,
    /// Address of the local service; must be an IP literal
    pub local_host: String,
    /// Port of the local service
    pub local_port: u16,
    /// Firewall binary (iptables or ip6tables)
    pub firewall: String,
    /// Delay between keep-alive datagrams
    pub keepalive_interval: Duration,
    /// Overall STUN transaction timeout; client default when unset
    #[serde(default)]
    pub stun_timeout: Option<Duration>,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            transport: TransportFamily::Dual,
            stopper_port: DEFAULT_STOPPER_PORT,
            stun_host: DEFAULT_STUN_HOST.to_string(),
            stun_port: DEFAULT_STUN_PORT,
            local_host: String::new(),
            local_port: DEFAULT_LOCAL_PORT,
            firewall: DEFAULT_FIREWALL.to_string(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            stun_timeout: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Transport protocol label is not udp, udp4 or udp6
    #[error("Protocol {0:?} is not supported")]
    UnsupportedProtocol(String),

    /// Local host is not an IP literal
    #[error("{0:?} is not a valid host name")]
    InvalidLocalHost(String),

    /// Local port is zero
    #[error("Local port should be specified.")]
    MissingLocalPort,

    /// Firewall command is empty
    #[error("Iptables command should be specified.")]
    MissingFirewall,

    /// Keep-alive interval is zero
    #[error("Keeper interval should be specified.")]
    MissingInterval,
}

impl TraversalConfig {
    /// Validate the configuration, reporting the first violated constraint
    ///
    /// The transport family is already constrained by its type; use
    /// [`parse_transport`] when it comes from text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.local_ip()?;

        if self.local_port == 0 {
            return Err(ConfigError::MissingLocalPort);
        }
        if self.firewall.trim().is_empty() {
            return Err(ConfigError::MissingFirewall);
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::MissingInterval);
        }

        Ok(())
    }

    /// Local host as an IP address
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidLocalHost` if it is not an IP literal.
    pub fn local_ip(&self) -> Result<IpAddr, ConfigError> {
        self.local_host
            .parse()
            .map_err(|_| ConfigError::InvalidLocalHost(self.local_host.clone()))
    }
}

/// Parse a transport protocol label (`udp`, `udp4`, `udp6`)
///
/// # Errors
///
/// Returns `ConfigError::UnsupportedProtocol` for any other label.
pub fn parse_transport(label: &str) -> Result<TransportFamily, ConfigError> {
    label
        .parse()
        .map_err(|_| ConfigError::UnsupportedProtocol(label.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TraversalConfig {
        TraversalConfig {
            local_host: "192.168.0.203".to_string(),
            ..TraversalConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TraversalConfig::default();
        assert_eq!(config.stopper_port, 15409);
        assert_eq!(config.stun_host, "stun.l.google.com");
        assert_eq!(config.stun_port, 19302);
        assert_eq!(config.local_port, 51820);
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_valid_config() {
        assert_eq!(valid().validate(), Ok(()));

        let mut v6 = valid();
        v6.local_host = "fd00::1".to_string();
        assert_eq!(v6.validate(), Ok(()));
    }

    #[test]
    fn test_parse_transport() {
        assert_eq!(parse_transport("udp"), Ok(TransportFamily::Dual));
        assert_eq!(parse_transport("udp4"), Ok(TransportFamily::V4));
        assert_eq!(parse_transport("udp6"), Ok(TransportFamily::V6));
        assert_eq!(
            parse_transport("tcp"),
            Err(ConfigError::UnsupportedProtocol("tcp".to_string()))
        );
    }

    #[test]
    fn test_rejects_invalid_local_host() {
        for host in ["", "localhost", "192.168.0", "10.0.0.1:80"] {
            let mut config = valid();
            config.local_host = host.to_string();
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidLocalHost(host.to_string()))
            );
        }
    }

    #[test]
    fn test_rejects_zero_local_port() {
        let mut config = valid();
        config.local_port = 0;
        assert_eq!(config.validate(), Err(ConfigError::MissingLocalPort));
    }

    #[test]
    fn test_rejects_empty_firewall() {
        let mut config = valid();
        config.firewall = String::new();
        assert_eq!(config.validate(), Err(ConfigError::MissingFirewall));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = valid();
        config.keepalive_interval = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::MissingInterval));
    }

    #[test]
    fn test_first_violation_reported() {
        let config = TraversalConfig {
            local_host: "nope".to_string(),
            local_port: 0,
            firewall: String::new(),
            keepalive_interval: Duration::ZERO,
            ..TraversalConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLocalHost("nope".to_string()))
        );

        let config = TraversalConfig {
            local_port: 0,
            firewall: String::new(),
            ..valid()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingLocalPort));
    }
}
