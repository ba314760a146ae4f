//! Traversal orchestration.
//!
//! One traversal runs these steps strictly in order:
//!
//! 1. Remove the stale redirect left by an earlier run
//! 2. Discover the public endpoint of the stopper port over STUN
//! 3. Keep the NAT mapping alive from a fresh socket on the same port
//! 4. Redirect inbound traffic on the stopper port to the local service
//!
//! A failing step aborts the traversal. Only the keeper is unwound (when the
//! redirect cannot be added); a removed rule is not restored.

use crate::config::TraversalConfig;
use crate::error::{Result, SocketError};
use crate::firewall::RedirectSynchronizer;
use doorstop_discovery::nat::{
    HoleKeeper, KeepaliveTarget, bind_connected, bind_reusable, discover, wildcard_for,
};
use serde::{Deserialize, Serialize};

/// Publicly reachable endpoint of the local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedEndpoint {
    /// Transport label (`udp`, `udp4` or `udp6`)
    pub protocol: String,
    /// External IP address
    pub host: String,
    /// External port
    pub port: u16,
}

/// A running traversal: the keeper and the endpoint it keeps open
#[derive(Debug)]
pub struct ActiveTraversal {
    /// Keep-alive loop owning the stopper socket
    pub keeper: HoleKeeper,
    /// Endpoint discovered for this traversal
    pub endpoint: ExposedEndpoint,
}

/// Sequences redirect synchronization, discovery and hole keeping
#[derive(Debug, Clone)]
pub struct TraversalOrchestrator {
    redirects: RedirectSynchronizer,
}

impl TraversalOrchestrator {
    /// Orchestrator applying redirects through `redirects`
    #[must_use]
    pub fn new(redirects: RedirectSynchronizer) -> Self {
        Self { redirects }
    }

    /// Run a full traversal for `config`
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that fails.
    pub async fn start(&self, config: &TraversalConfig) -> Result<ActiveTraversal> {
        let local_ip = config.local_ip()?;

        self.redirects
            .remove_stale_redirect(&config.firewall, local_ip, config.stopper_port)
            .await?;

        tracing::debug!("Resolve {}:{}", config.stun_host, config.stun_port);
        let server = config
            .transport
            .resolve(&config.stun_host, config.stun_port)
            .await
            .map_err(|source| SocketError::Resolve {
                host: config.stun_host.clone(),
                port: config.stun_port,
                source,
            })?;

        let local = wildcard_for(&server, config.stopper_port);
        tracing::debug!("Open {} toward {}", local, server);
        let socket = bind_connected(local, server)
            .await
            .map_err(|source| SocketError::Open { local, source })?;

        // Consumes the socket and releases the port
        let external = discover(socket, config.stun_timeout).await?;

        let socket = bind_reusable(local).map_err(|source| SocketError::Open { local, source })?;
        let target = KeepaliveTarget {
            host: external.ip().to_string(),
            port: external.port(),
            family: config.transport,
        };
        tracing::debug!("Start hole keeper");
        let keeper = HoleKeeper::start(socket, target, config.keepalive_interval);

        if let Err(e) = self
            .redirects
            .add_redirect(
                &config.firewall,
                local_ip,
                config.stopper_port,
                config.local_port,
            )
            .await
        {
            if let Err(close) = keeper.close().await {
                tracing::warn!("Failed to close hole keeper: {}", close);
            }
            return Err(e.into());
        }

        let endpoint = ExposedEndpoint {
            protocol: config.transport.to_string(),
            host: external.ip().to_string(),
            port: external.port(),
        };
        tracing::info!(
            "Exposed {}:{} as {}:{}",
            config.local_host,
            config.local_port,
            endpoint.host,
            endpoint.port
        );

        Ok(ActiveTraversal { keeper, endpoint })
    }

    /// Remove the redirect installed for `config`, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the local host is invalid or the firewall
    /// commands fail.
    pub async fn remove_redirect(&self, config: &TraversalConfig) -> Result<Option<usize>> {
        let local_ip = config.local_ip()?;
        let removed = self
            .redirects
            .remove_stale_redirect(&config.firewall, local_ip, config.stopper_port)
            .await?;
        Ok(removed)
    }
}
