//! # QUIC Transport
//!
//! One UDP socket per node carries every connection. Both sides present
//! self-signed Ed25519 certificates (see [`crate::crypto`]), so once the
//! handshake finishes each side knows the remote [`PeerId`] for certain.
//!
//! - [`bind_endpoint`]: create the endpoint (server + default client config)
//! - [`listen`]: accept loop handing verified inbound [`Connection`]s to a channel
//! - [`dial`]: outbound connection to a [`PeerAddress`], bounded by a timeout
//!
//! Connection caching and request framing live in [`crate::rpc`].

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, ServerConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::{extract_verified_peer, peer_to_sni};
use crate::error::{Error, Result};
use crate::identity::{PeerAddress, PeerId};

/// Which side opened a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An authenticated QUIC connection to one peer.
#[derive(Clone)]
pub struct Connection {
    inner: quinn::Connection,
    peer: PeerId,
    direction: Direction,
    established: Instant,
}

impl Connection {
    pub(crate) fn new(inner: quinn::Connection, peer: PeerId, direction: Direction) -> Self {
        Self {
            inner,
            peer,
            direction,
            established: Instant::now(),
        }
    }

    /// PeerId proven by the remote certificate.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    pub fn close(&self) {
        self.inner.close(0u32.into(), b"closed");
    }

    /// Time since the handshake completed.
    pub(crate) fn age(&self) -> Duration {
        self.established.elapsed()
    }

    /// Identifier distinguishing this connection from later ones to the same peer.
    pub fn stable_id(&self) -> usize {
        self.inner.stable_id()
    }

    /// Resolves once the connection is closed for any reason.
    pub async fn closed(&self) {
        self.inner.closed().await;
    }

    pub(crate) fn quic(&self) -> &quinn::Connection {
        &self.inner
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("remote", &self.remote_addr())
            .field("direction", &self.direction)
            .finish()
    }
}

/// Connection lifecycle notifications. Every connection a node keeps gets one
/// `Connected` and at most one `Closed`, and events for a peer alternate.
///
/// A node keeps a single connection per peer. A duplicate from crossed dials
/// is closed before it is announced; a connection replaced by a newer one is
/// reported `Closed` first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        peer: PeerId,
        remote: SocketAddr,
        direction: Direction,
    },
    Closed {
        peer: PeerId,
    },
}

// ============================================================================
// Endpoint
// ============================================================================

pub fn bind_endpoint(
    addr: SocketAddr,
    server_config: ServerConfig,
    client_config: ClientConfig,
) -> Result<Endpoint> {
    let mut endpoint =
        Endpoint::server(server_config, addr).map_err(|source| Error::Bind { addr, source })?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Running accept loop. Dropping the handle stops accepting.
#[derive(Debug)]
pub struct ListenHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Accept inbound connections until `shutdown` fires. Each verified
/// connection is sent to `accepted`; handshakes slower than
/// `handshake_timeout` or without a usable certificate are dropped.
pub fn listen(
    endpoint: Endpoint,
    handshake_timeout: Duration,
    accepted: mpsc::Sender<Connection>,
    shutdown: CancellationToken,
) -> std::io::Result<ListenHandle> {
    let local_addr = endpoint.local_addr()?;

    let task = tokio::spawn(async move {
        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            let accepted = accepted.clone();
            tokio::spawn(async move {
                let remote = incoming.remote_address();
                let connection = match tokio::time::timeout(handshake_timeout, incoming).await {
                    Ok(Ok(connection)) => connection,
                    Ok(Err(e)) => {
                        debug!(remote = %remote, error = %e, "inbound handshake failed");
                        return;
                    }
                    Err(_) => {
                        debug!(remote = %remote, "inbound handshake timed out");
                        return;
                    }
                };

                let Some(peer) = extract_verified_peer(&connection) else {
                    warn!(remote = %remote, "rejecting connection: could not verify peer identity");
                    connection.close(1u32.into(), b"unverified");
                    return;
                };

                trace!(peer = %peer.short(), remote = %remote, "accepted inbound connection");
                let _ = accepted
                    .send(Connection::new(connection, peer, Direction::Inbound))
                    .await;
            });
        }
        debug!(addr = %local_addr, "listener stopped");
    });

    Ok(ListenHandle { local_addr, task })
}

// ============================================================================
// Dialing
// ============================================================================

/// Open a connection to `target`, requiring its certificate to hash to
/// `target.peer`.
pub async fn dial(endpoint: &Endpoint, target: &PeerAddress, timeout: Duration) -> Result<Connection> {
    let sni = peer_to_sni(&target.peer);
    let connecting = endpoint.connect(target.addr, &sni).map_err(|e| match e {
        quinn::ConnectError::EndpointStopping => Error::Shutdown,
        other => Error::Handshake(format!("cannot connect to {}: {other}", target.addr)),
    })?;

    let connection = match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(quinn::ConnectionError::TimedOut)) => {
            return Err(Error::Timeout(format!("connecting to {}", target.addr)));
        }
        Ok(Err(e)) => {
            return Err(Error::Handshake(format!("{}: {e}", target.addr)));
        }
        Err(_) => {
            return Err(Error::Timeout(format!(
                "connecting to {} after {:?}",
                target.addr, timeout
            )));
        }
    };

    match extract_verified_peer(&connection) {
        Some(peer) if peer == target.peer => {
            trace!(peer = %peer.short(), addr = %target.addr, "outbound connection established");
            Ok(Connection::new(connection, peer, Direction::Outbound))
        }
        other => {
            connection.close(1u32.into(), b"identity mismatch");
            Err(Error::Handshake(format!(
                "{} presented {:?}, expected {}",
                target.addr,
                other.map(|p| p.short()),
                target.peer.short()
            )))
        }
    }
}
