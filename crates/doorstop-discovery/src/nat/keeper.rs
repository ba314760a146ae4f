//! NAT hole keeper
//!
//! Keeps a NAT mapping alive by periodically sending a one-byte datagram from
//! the mapped local port to the mapping's own public endpoint. Without this
//! traffic most NATs expire a UDP mapping after tens of seconds.

use super::socket::TransportFamily;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OnceCell, oneshot};
use tokio::task::JoinHandle;

/// Keep-alive payload
const KEEPALIVE: &[u8] = &[0];

/// Remote end of the keep-alive traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveTarget {
    /// Host name or IP literal
    pub host: String,
    /// UDP port
    pub port: u16,
    /// Family used when resolving `host`
    pub family: TransportFamily,
}

/// Hole keeper teardown error
///
/// Cloneable so a single captured outcome can be handed to every caller of
/// [`HoleKeeper::close`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeeperError {
    /// The background task panicked or was cancelled before it could hand
    /// back the socket
    #[error("keep-alive task failed: {0}")]
    Task(String),
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<UdpSocket>,
}

/// Handle to a running keep-alive loop
///
/// Owns the socket (through its task) until [`HoleKeeper::close`]. Dropping
/// the handle without closing also stops the loop.
pub struct HoleKeeper {
    running: Mutex<Option<Running>>,
    outcome: OnceCell<Result<(), KeeperError>>,
    teardowns: AtomicUsize,
}

impl HoleKeeper {
    /// Start the keep-alive loop on `socket`
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(socket: UdpSocket, target: KeepaliveTarget, interval: Duration) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(keep_alive(socket, target, interval, stop_rx));

        Self {
            running: Mutex::new(Some(Running { stop, task })),
            outcome: OnceCell::new(),
            teardowns: AtomicUsize::new(0),
        }
    }

    /// Stop the loop and close the socket
    ///
    /// Idempotent: the first caller performs the teardown, every caller
    /// (including concurrent ones, which wait for it) observes the same
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `KeeperError` if the background task did not end cleanly.
    pub async fn close(&self) -> Result<(), KeeperError> {
        self.outcome.get_or_init(|| self.teardown()).await.clone()
    }

    /// Whether the keeper has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outcome.initialized()
    }

    /// Number of teardowns actually performed, 0 or 1
    #[cfg(test)]
    fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    async fn teardown(&self) -> Result<(), KeeperError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);

        let Some(Running { stop, task }) = self.running.lock().await.take() else {
            return Ok(());
        };

        // The loop may already have exited; a closed channel is fine
        let _ = stop.send(());

        match task.await {
            Ok(socket) => {
                drop(socket);
                tracing::debug!("Hole keeper closed");
                Ok(())
            }
            Err(e) => Err(KeeperError::Task(e.to_string())),
        }
    }
}

impl std::fmt::Debug for HoleKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoleKeeper")
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn keep_alive(
    socket: UdpSocket,
    target: KeepaliveTarget,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) -> UdpSocket {
    loop {
        tracing::trace!("Send dummy to {}:{}", target.host, target.port);
        let sent = match target.family.resolve(&target.host, target.port).await {
            Ok(remote) => socket.send_to(KEEPALIVE, remote).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!(
                "Keep-alive to {}:{} failed: {}",
                target.host,
                target.port,
                e
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            // Explicit stop, or the handle was dropped
            _ = &mut stop => {
                tracing::debug!("Hole keeper stopped");
                break;
            }
        }
    }

    socket
}
