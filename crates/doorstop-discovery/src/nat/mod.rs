//! NAT Traversal Module
//!
//! Discovers the public endpoint a NAT maps a local UDP port to, and keeps
//! that mapping alive.
//!
//! # Components
//!
//! - **STUN Client**: Binding transactions (RFC 5389) for server reflexive address discovery
//! - **Discovery**: One-shot `async` wrapper around a STUN transaction
//! - **Sockets**: `SO_REUSEADDR` UDP sockets so the stopper port can be rebound
//! - **Hole Keeper**: Periodic keep-alive datagrams with idempotent shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use doorstop_discovery::nat::{
//!     HoleKeeper, KeepaliveTarget, TransportFamily, bind_connected, bind_reusable, discover,
//!     wildcard_for,
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let family = TransportFamily::V4;
//! let server = family.resolve("stun.l.google.com", 19302).await?;
//! let local = wildcard_for(&server, 15409);
//!
//! let mapped = discover(bind_connected(local, server).await?, None).await?;
//! println!("Exposed at {}", mapped);
//!
//! let target = KeepaliveTarget {
//!     host: mapped.ip().to_string(),
//!     port: mapped.port(),
//!     family,
//! };
//! let keeper = HoleKeeper::start(bind_reusable(local)?, target, Duration::from_secs(5));
//! keeper.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod discover;
pub mod keeper;
pub mod socket;
pub mod stun;

// Re-exports
pub use discover::{DiscoveryError, discover};
pub use keeper::{HoleKeeper, KeepaliveTarget, KeeperError};
pub use socket::{TransportFamily, bind_connected, bind_reusable, wildcard_for};
pub use stun::{
    StunAttribute, StunClient, StunError, StunEvent, StunMessage, StunMessageClass,
    StunMessageType,
};
