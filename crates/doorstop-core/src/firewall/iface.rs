//! Network interface lookup.

use crate::error::RedirectError;
use std::net::IpAddr;

/// Finds the interface an address is assigned to
pub trait InterfaceLookup: Send + Sync {
    /// Name of the interface carrying `ip`
    ///
    /// # Errors
    ///
    /// Returns `RedirectError::InterfaceNotFound` if no interface carries
    /// `ip`, or `RedirectError::Interfaces` if enumeration fails.
    fn interface_for(&self, ip: IpAddr) -> Result<String, RedirectError>;
}

/// Looks interfaces up on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceLookup for SystemInterfaces {
    fn interface_for(&self, ip: IpAddr) -> Result<String, RedirectError> {
        tracing::debug!("Listing interfaces");
        let addresses = local_ip_address::list_afinet_netifas()
            .map_err(|e| RedirectError::Interfaces(e.to_string()))?;

        find_interface(addresses, ip)
    }
}

/// First interface in `addresses` carrying `ip`
pub(crate) fn find_interface<I>(addresses: I, ip: IpAddr) -> Result<String, RedirectError>
where
    I: IntoIterator<Item = (String, IpAddr)>,
{
    addresses
        .into_iter()
        .find(|(name, addr)| {
            tracing::trace!("Interface {} has {}", name, addr);
            *addr == ip
        })
        .map(|(name, _)| {
            tracing::debug!("Interface {} matches", name);
            name
        })
        .ok_or(RedirectError::InterfaceNotFound(ip))
}
