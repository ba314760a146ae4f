//! Configuration file for the Doorstop daemon.

use doorstop_core::config::{
    DEFAULT_FIREWALL, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_LOCAL_PORT, DEFAULT_STOPPER_PORT,
    DEFAULT_STUN_HOST, DEFAULT_STUN_PORT,
};
use doorstop_core::{TraversalConfig, parse_transport};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Doorstop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Traversal configuration
    #[serde(default)]
    pub traversal: TraversalSection,
    /// Control API configuration
    #[serde(default)]
    pub api: ApiSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalSection {
    /// Transport protocol: udp, udp4 or udp6
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Stopper port
    #[serde(default = "default_stopper_port")]
    pub port: u16,
    /// STUN server hostname
    #[serde(default = "default_stun_host")]
    pub stun_host: String,
    /// STUN server port
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,
    /// Local service address
    #[serde(default)]
    pub local_host: String,
    /// Local service port
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// iptables binary
    #[serde(default = "default_iptables")]
    pub iptables: String,
    /// Keep-alive interval
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// STUN transaction timeout
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub stun_timeout: Option<Duration>,
}

/// Control API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    /// Host name to listen on
    #[serde(default = "default_api_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_protocol() -> String {
    "udp".to_string()
}

fn default_stopper_port() -> u16 {
    DEFAULT_STOPPER_PORT
}

fn default_stun_host() -> String {
    DEFAULT_STUN_HOST.to_string()
}

fn default_stun_port() -> u16 {
    DEFAULT_STUN_PORT
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

fn default_iptables() -> String {
    DEFAULT_FIREWALL.to_string()
}

fn default_interval() -> Duration {
    DEFAULT_KEEPALIVE_INTERVAL
}

fn default_api_host() -> String {
    "localhost".to_string()
}

fn default_api_port() -> u16 {
    15409
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TraversalSection {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            port: default_stopper_port(),
            stun_host: default_stun_host(),
            stun_port: default_stun_port(),
            local_host: String::new(),
            local_port: default_local_port(),
            iptables: default_iptables(),
            interval: default_interval(),
            stun_timeout: None,
        }
    }
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("doorstop/config.toml")
    }

    /// Load config from default path, or defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Traversal configuration for the service
    ///
    /// # Errors
    ///
    /// Returns an error if the protocol is not supported.
    pub fn traversal_config(&self) -> anyhow::Result<TraversalConfig> {
        let section = &self.traversal;
        Ok(TraversalConfig {
            transport: parse_transport(&section.protocol)?,
            stopper_port: section.port,
            stun_host: section.stun_host.clone(),
            stun_port: section.stun_port,
            local_host: section.local_host.clone(),
            local_port: section.local_port,
            firewall: section.iptables.clone(),
            keepalive_interval: section.interval,
            stun_timeout: section.stun_timeout,
        })
    }
}
