//! # Doorstop Core
//!
//! Traversal engine exposing a local UDP service through NAT.
//!
//! This crate provides:
//! - Configuration and validation ([`TraversalConfig`])
//! - The iptables redirect synchronizer ([`firewall`])
//! - Traversal orchestration: stale rule removal, STUN discovery, hole
//!   keeping and redirect installation ([`traversal`])
//! - The configure/start/stop state machine ([`TraversalService`])
//!
//! ## Example
//!
//! ```no_run
//! use doorstop_core::{TraversalConfig, TraversalService};
//!
//! # async fn example() -> doorstop_core::Result<()> {
//! let service = TraversalService::new();
//! service
//!     .configure(TraversalConfig {
//!         local_host: "192.168.0.203".to_string(),
//!         ..TraversalConfig::default()
//!     })
//!     .await?;
//! service.start().await?;
//!
//! if let Some(endpoint) = service.endpoint() {
//!     println!("reachable at {}:{}", endpoint.host, endpoint.port);
//! }
//!
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod firewall;
pub mod service;
pub mod traversal;

pub use config::{ConfigError, TraversalConfig, parse_transport};
pub use doorstop_discovery::TransportFamily;
pub use error::{Error, RedirectError, Result, SocketError};
pub use service::TraversalService;
pub use traversal::{ActiveTraversal, ExposedEndpoint, TraversalOrchestrator};
