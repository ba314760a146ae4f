//! Error types for the Doorstop traversal engine.
//!
//! Errors are grouped by the stage that produced them so callers (the HTTP
//! control layer in particular) can decide how to react:
//!
//! - **Configuration**: rejected before anything starts
//! - **Discovery**: STUN exchange failed; nothing is left running
//! - **Redirect**: firewall command failed; a just-started keeper is torn down first
//! - **Socket**: bind, connect or teardown failure

use crate::config::ConfigError;
use doorstop_discovery::{DiscoveryError, KeeperError};
use std::net::SocketAddr;
use thiserror::Error;

/// Traversal engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// External endpoint discovery failed
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Firewall redirect could not be listed, removed or installed
    #[error("redirect error: {0}")]
    Redirect(#[from] RedirectError),

    /// Socket setup or teardown failed
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Operation requires a configuration
    #[error("service is not configured")]
    NotConfigured,
}

/// Firewall redirect errors
#[derive(Debug, Error)]
pub enum RedirectError {
    /// The firewall command could not be spawned
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// The firewall command exited unsuccessfully
    #[error("{program} {args} exited with {status}")]
    CommandFailed {
        /// Program that was run
        program: String,
        /// Space separated arguments
        args: String,
        /// Exit status description
        status: String,
    },

    /// Waiting for the firewall command failed
    #[error("failed to wait for {program}: {source}")]
    Wait {
        /// Program being waited on
        program: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Reading the rule listing failed before end of output
    #[error("failed to read rule listing: {0}")]
    Listing(#[source] std::io::Error),

    /// The listing scanner ended without reporting
    #[error("rule listing scanner ended without a result")]
    ScannerLost,

    /// Local host is not an IP literal
    #[error("{0:?} is not a valid host name")]
    InvalidHost(String),

    /// No interface carries the local address
    #[error("no interface is bound to {0}")]
    InterfaceNotFound(std::net::IpAddr),

    /// Interface enumeration failed
    #[error("failed to list network interfaces: {0}")]
    Interfaces(String),
}

/// Socket errors
#[derive(Debug, Error)]
pub enum SocketError {
    /// Host name resolution failed
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        /// Host being resolved
        host: String,
        /// Port being resolved
        port: u16,
        /// Underlying error
        source: std::io::Error,
    },

    /// Binding or connecting a socket failed
    #[error("failed to open UDP socket on {local}: {source}")]
    Open {
        /// Local address
        local: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// Closing the hole keeper failed
    #[error("failed to close hole keeper: {0}")]
    Close(#[from] KeeperError),
}

/// Result type for traversal operations
pub type Result<T> = std::result::Result<T, Error>;
