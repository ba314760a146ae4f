//! # Doorstop Discovery
//!
//! External endpoint discovery for Doorstop.
//!
//! This crate provides:
//! - A transaction-based STUN client (RFC 5389 Binding)
//! - Server reflexive address discovery over a connected UDP socket
//! - A hole keeper that sends periodic keep-alives to hold the NAT mapping open
//!
//! See [`nat`] for an end-to-end example.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod nat;

// Re-export commonly used types
pub use nat::{
    DiscoveryError, HoleKeeper, KeepaliveTarget, KeeperError, StunClient, StunError,
    TransportFamily,
};
