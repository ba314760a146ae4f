//! UDP socket construction for discovery and keep-alive traffic.
//!
//! Both sockets of a traversal share the stopper port: the discovery socket
//! is released before the keeper socket is bound, so every socket is created
//! with `SO_REUSEADDR` to allow the immediate rebind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::UdpSocket;

/// Address family used for the exposed endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportFamily {
    /// IPv4 or IPv6, whichever the STUN server resolves to first
    #[default]
    #[serde(rename = "udp")]
    Dual,
    /// IPv4 only
    #[serde(rename = "udp4")]
    V4,
    /// IPv6 only
    #[serde(rename = "udp6")]
    V6,
}

impl TransportFamily {
    /// Protocol label reported alongside the exposed endpoint
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dual => "udp",
            Self::V4 => "udp4",
            Self::V6 => "udp6",
        }
    }

    /// Whether `addr` may be used with this family
    #[must_use]
    pub fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Dual => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }

    /// Resolve `host:port`, keeping the first address this family admits
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no admissible address.
    pub async fn resolve(self, host: &str, port: u16) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await?
            .find(|addr| self.admits(addr))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no {} address for {}:{}", self.as_str(), host, port),
                )
            })
    }
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Self::Dual),
            "udp4" => Ok(Self::V4),
            "udp6" => Ok(Self::V6),
            other => Err(format!("Protocol {other:?} is not supported")),
        }
    }
}

/// Unspecified address of the same family as `peer`, on `port`
#[must_use]
pub fn wildcard_for(peer: &SocketAddr, port: u16) -> SocketAddr {
    let ip: IpAddr = if peer.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    SocketAddr::new(ip, port)
}

/// Bind a non-blocking UDP socket with `SO_REUSEADDR` set
///
/// # Errors
///
/// Returns an error if the socket cannot be created or bound.
pub fn bind_reusable(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };

    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Bind to `local` and connect toward `peer`
///
/// # Errors
///
/// Returns an error if binding or connecting fails.
pub async fn bind_connected(local: SocketAddr, peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = bind_reusable(local)?;
    socket.connect(peer).await?;
    Ok(socket)
}
