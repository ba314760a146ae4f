//! Firewall redirect management
//!
//! Traffic arriving at the stopper port has to reach the local service. The
//! kernel does that with a `nat` PREROUTING `REDIRECT` rule, kept in sync by
//! [`RedirectSynchronizer`]:
//!
//! - [`runner`]: spawns firewall commands with streamed output
//! - [`iface`]: resolves the interface carrying the local address
//! - [`iptables`]: lists, deletes and appends redirect rules

pub mod iface;
pub mod iptables;
pub mod runner;

pub use iface::{InterfaceLookup, SystemInterfaces};
pub use iptables::RedirectSynchronizer;
pub use runner::{
    CommandCompletion, CommandOutput, CommandRunner, ProcessRunner, RunningCommand, run,
};
