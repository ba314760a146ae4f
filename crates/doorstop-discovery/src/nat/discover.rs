//! External endpoint discovery.
//!
//! Runs a single Binding transaction over a connected socket and reports the
//! server reflexive address, i.e. the public `(ip, port)` the NAT mapped the
//! socket's local port to.

use super::stun::{StunClient, StunError, StunMessage};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The exchange could not be started or did not complete
    #[error("STUN exchange failed: {0}")]
    Stun(#[from] StunError),

    /// The transaction ended without reporting an outcome
    #[error("STUN transaction abandoned without a result")]
    Abandoned,

    /// The response carried no XOR-MAPPED-ADDRESS
    #[error("STUN response has no XOR-MAPPED-ADDRESS")]
    NoMappedAddress,
}

/// Discover the public endpoint of `socket`
///
/// `socket` must be connected to the STUN server. It is consumed: the STUN
/// client owns it for the duration of the exchange and releases it before
/// this returns, so the local port can be bound again afterwards.
///
/// `timeout` bounds the whole transaction, retransmissions included; `None`
/// keeps the client default.
///
/// # Errors
///
/// Returns `DiscoveryError` if the exchange fails, times out, yields an
/// error response, or the response lacks the mapped address.
pub async fn discover(
    socket: UdpSocket,
    timeout: Option<Duration>,
) -> Result<SocketAddr, DiscoveryError> {
    tracing::debug!("Create STUN client");
    let mut client = StunClient::new(socket);
    if let Some(timeout) = timeout {
        client.set_timeout(timeout);
    }

    let request = StunMessage::binding_request();

    // The handler runs exactly once; whichever outcome it carries is the
    // only one ever written.
    let (tx, rx) = oneshot::channel();
    tracing::debug!("Perform STUN transaction");
    if let Err(e) = client
        .start(request, move |event| {
            let _ = tx.send(event.result);
        })
        .await
    {
        client.close().await;
        return Err(e.into());
    }

    let outcome = rx.await;
    client.close().await;

    let response = outcome.map_err(|_| DiscoveryError::Abandoned)??;
    let mapped = response
        .xor_mapped_address()
        .ok_or(DiscoveryError::NoMappedAddress)?;

    tracing::info!("External Address: {}", mapped);
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::{StunAttribute, StunMessageClass};

    /// Answer one request with whatever `respond` builds
    async fn serve_once<F>(respond: F) -> SocketAddr
    where
        F: FnOnce(&StunMessage, SocketAddr) -> StunMessage + Send + 'static,
    {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let response = respond(&request, from);
            server.send_to(&response.encode(), from).await.unwrap();
        });

        addr
    }

    async fn connected_socket(server: SocketAddr) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn test_discover_reports_reflexive_address() {
        let server = serve_once(StunMessage::binding_success).await;
        let socket = connected_socket(server).await;
        let local = socket.local_addr().unwrap();

        let mapped = discover(socket, None).await.unwrap();
        assert_eq!(mapped, local);
    }

    #[tokio::test]
    async fn test_discover_without_mapped_address() {
        let server = serve_once(|request, _| {
            let mut response =
                StunMessage::binding_success(request, "0.0.0.0:0".parse().unwrap());
            response.attributes = vec![StunAttribute::Software("test".to_string())];
            response
        })
        .await;
        let socket = connected_socket(server).await;

        let result = discover(socket, None).await;
        assert!(matches!(result, Err(DiscoveryError::NoMappedAddress)));
    }

    #[tokio::test]
    async fn test_discover_error_response() {
        let server = serve_once(|request, _| {
            let mut response = request.clone();
            response.message_class = StunMessageClass::ErrorResponse;
            response.add_attribute(StunAttribute::ErrorCode {
                code: 400,
                reason: "Bad Request".to_string(),
            });
            response
        })
        .await;
        let socket = connected_socket(server).await;

        let result = discover(socket, None).await;
        assert!(matches!(
            result,
            Err(DiscoveryError::Stun(StunError::ErrorResponse { code: 400, .. }))
        ));
    }

    #[tokio::test]
    async fn test_discover_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = connected_socket(silent.local_addr().unwrap()).await;

        let result = discover(socket, Some(Duration::from_millis(200))).await;
        assert!(matches!(
            result,
            Err(DiscoveryError::Stun(StunError::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_discover_unconnected_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = discover(socket, None).await;
        assert!(matches!(
            result,
            Err(DiscoveryError::Stun(StunError::NotConnected))
        ));
    }
}
