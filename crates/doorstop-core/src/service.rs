//! Traversal service state machine.
//!
//! [`TraversalService`] owns the accepted configuration and the running
//! traversal. `configure`, `start`, `stop` and `remove_redirect` serialize on
//! one lock; `endpoint` reads a published snapshot and never waits for them.

use crate::config::TraversalConfig;
use crate::error::{Error, Result, SocketError};
use crate::firewall::{CommandRunner, InterfaceLookup, RedirectSynchronizer};
use crate::traversal::{ActiveTraversal, ExposedEndpoint, TraversalOrchestrator};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

#[derive(Debug, Default)]
struct ServiceState {
    config: Option<TraversalConfig>,
    active: Option<ActiveTraversal>,
}

/// Exposes one local UDP service at a time
#[derive(Debug)]
pub struct TraversalService {
    orchestrator: TraversalOrchestrator,
    state: Mutex<ServiceState>,
    endpoint: watch::Sender<Option<ExposedEndpoint>>,
}

impl TraversalService {
    /// Service driving the host firewall
    #[must_use]
    pub fn new() -> Self {
        Self::from_synchronizer(RedirectSynchronizer::system())
    }

    /// Service using the given firewall command runner and interface lookup
    #[must_use]
    pub fn with_backends(
        runner: Arc<dyn CommandRunner>,
        interfaces: Arc<dyn InterfaceLookup>,
    ) -> Self {
        Self::from_synchronizer(RedirectSynchronizer::new(runner, interfaces))
    }

    fn from_synchronizer(redirects: RedirectSynchronizer) -> Self {
        let (endpoint, _) = watch::channel(None);
        Self {
            orchestrator: TraversalOrchestrator::new(redirects),
            state: Mutex::new(ServiceState::default()),
            endpoint,
        }
    }

    /// Validate and accept `config`
    ///
    /// A running traversal keeps its configuration until the next start.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for the first invalid field; the
    /// previous configuration is kept.
    pub async fn configure(&self, config: TraversalConfig) -> Result<()> {
        config.validate()?;

        tracing::debug!("Configured {:?}", config);
        self.state.lock().await.config = Some(config);
        Ok(())
    }

    /// Start a traversal, stopping the running one first
    ///
    /// A failure to close the previous keeper is logged and does not prevent
    /// the restart.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` without a configuration, or the error
    /// of the failing step.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Err(e) = self.stop_locked(&mut state).await {
            tracing::warn!("Previous traversal did not stop cleanly: {}", e);
        }

        let config = state.config.clone().ok_or(Error::NotConfigured)?;
        let active = self.orchestrator.start(&config).await?;

        self.endpoint.send_replace(Some(active.endpoint.clone()));
        state.active = Some(active);
        Ok(())
    }

    /// Stop the running traversal, if any
    ///
    /// The redirect rule stays installed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Socket` if the keeper did not shut down cleanly.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    async fn stop_locked(&self, state: &mut ServiceState) -> Result<()> {
        // Only an actual change notifies subscribers
        self.endpoint.send_if_modified(|endpoint| endpoint.take().is_some());

        let Some(active) = state.active.take() else {
            return Ok(());
        };

        tracing::debug!("Stop hole keeper");
        active.keeper.close().await.map_err(SocketError::from)?;
        Ok(())
    }

    /// Remove the redirect rule of the current configuration
    ///
    /// Returns the deleted rule number, if one was found.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` without a configuration, or the
    /// firewall error.
    pub async fn remove_redirect(&self) -> Result<Option<usize>> {
        let state = self.state.lock().await;
        let config = state.config.as_ref().ok_or(Error::NotConfigured)?;
        self.orchestrator.remove_redirect(config).await
    }

    /// Currently exposed endpoint
    #[must_use]
    pub fn endpoint(&self) -> Option<ExposedEndpoint> {
        self.endpoint.borrow().clone()
    }

    /// Receiver notified whenever the exposed endpoint changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ExposedEndpoint>> {
        self.endpoint.subscribe()
    }

    /// Transport label of the current configuration, empty when unconfigured
    pub async fn protocol(&self) -> String {
        self.state
            .lock()
            .await
            .config
            .as_ref()
            .map(|config| config.transport.to_string())
            .unwrap_or_default()
    }
}

impl Default for TraversalService {
    fn default() -> Self {
        Self::new()
    }
}
