//! # RPC Layer
//!
//! Request/response plumbing for the DHT and FloodSub over authenticated QUIC
//! connections.
//!
//! ## Architecture
//!
//! - [`RpcNode`]: public handle (cheap to clone) implementing [`DhtRpc`] and
//!   [`FloodSubRpc`]
//! - `RpcActor`: owns the connection registry, one live connection per peer
//!   regardless of which side dialed
//! - [`serve_connection`]: per-connection loop accepting request streams
//!
//! ## Framing
//!
//! One bidirectional stream per request. Each direction carries a single
//! 4-byte big-endian length followed by a bincode body. Requests are capped
//! at [`MAX_REQUEST_SIZE`], responses at [`MAX_RESPONSE_SIZE`].
//!
//! ## Identity
//!
//! The PeerId in a DHT request's `from` must match the certificate of the
//! connection it arrived on. FloodSub messages are authenticated by their own
//! signature instead, because they are relayed.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use lru::LruCache;
use quinn::Endpoint;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cancel::Deadline;
use crate::dht::{DhtNode, Key, MAX_PEERS_PER_RESPONSE};
use crate::error::{Error, Result};
use crate::floodsub::FloodSub;
use crate::identity::{ContentKey, PeerAddress, PeerId};
use crate::messages::{
    self, DhtRequest, DhtResponse, Message, RpcRequest, RpcResponse, MAX_REQUEST_SIZE,
    MAX_RESPONSE_SIZE,
};
use crate::protocols::{DhtRpc, FloodSubRpc};
use crate::transport::{dial, Connection, ConnectionEvent, Direction};

/// Maximum number of registered connections. The least recently used one is
/// closed when a new peer would exceed it.
const MAX_CACHED_CONNECTIONS: usize = 1_000;

const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of the connection event broadcast. Slow receivers observe `Lagged`.
pub const EVENT_CHANNEL_SIZE: usize = 256;

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Two connections to one peer completing this close together are treated
/// as crossed dials rather than a reconnect.
const CROSSED_DIAL_WINDOW: Duration = Duration::from_secs(5);

/// Choose between two live connections to the same peer. Both ends must
/// agree without talking: when the dials crossed, the one dialed by the
/// smaller PeerId survives. Otherwise the newer one replaces a connection the
/// remote has most likely abandoned.
fn keeps_existing(local: PeerId, existing: &Connection, incoming: &Connection) -> bool {
    if existing.direction() == incoming.direction() || existing.age() > CROSSED_DIAL_WINDOW {
        return false;
    }
    let keep = if local < existing.peer() {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    existing.direction() == keep
}

// ============================================================================
// Actor Commands
// ============================================================================

enum RpcCommand {
    Lookup {
        peer: PeerId,
        reply: oneshot::Sender<Option<Connection>>,
    },
    Register {
        connection: Connection,
        reply: oneshot::Sender<Connection>,
    },
    Announce {
        peer: PeerId,
        stable_id: usize,
    },
    Closed {
        peer: PeerId,
        stable_id: usize,
        reply: oneshot::Sender<bool>,
    },
    Peers(oneshot::Sender<Vec<PeerId>>),
    Quit,
}

// ============================================================================
// Actor (owns the connection registry)
// ============================================================================

struct RpcActor {
    local: PeerId,
    connections: LruCache<PeerId, Entry>,
    events: broadcast::Sender<ConnectionEvent>,
    new_connections: mpsc::UnboundedSender<Connection>,
}

/// A registered connection and whether `Connected` went out for it. Only
/// announced connections are later reported `Closed`.
struct Entry {
    connection: Connection,
    announced: bool,
}

impl RpcActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RpcCommand::Lookup { peer, reply } => {
                    let _ = reply.send(self.live(&peer));
                }
                RpcCommand::Register { connection, reply } => {
                    let _ = reply.send(self.register(connection));
                }
                RpcCommand::Announce { peer, stable_id } => self.announce(peer, stable_id),
                RpcCommand::Closed {
                    peer,
                    stable_id,
                    reply,
                } => {
                    let _ = reply.send(self.forget(peer, stable_id));
                }
                RpcCommand::Peers(reply) => {
                    let peers = self
                        .connections
                        .iter()
                        .filter(|(_, entry)| !entry.connection.is_closed())
                        .map(|(peer, _)| *peer)
                        .collect();
                    let _ = reply.send(peers);
                }
                RpcCommand::Quit => {
                    for (_, entry) in self.connections.iter() {
                        entry.connection.close();
                    }
                    debug!("rpc actor shutting down");
                    break;
                }
            }
        }
    }

    fn live(&mut self, peer: &PeerId) -> Option<Connection> {
        let conn = self.connections.get(peer)?.connection.clone();
        if conn.is_closed() {
            trace!(peer = %peer.short(), "cached connection is closed");
            None
        } else {
            Some(conn)
        }
    }

    /// Keep one live connection per peer and close the other. A duplicate
    /// that loses against the registered connection is closed before anyone
    /// hears of it.
    fn register(&mut self, connection: Connection) -> Connection {
        let peer = connection.peer();
        if let Some(entry) = self.connections.peek(&peer) {
            let existing = &entry.connection;
            if existing.stable_id() == connection.stable_id() {
                return existing.clone();
            }
            if !existing.is_closed() {
                if keeps_existing(self.local, existing, &connection) {
                    trace!(peer = %peer.short(), "closing duplicate connection");
                    connection.close();
                    return existing.clone();
                }
                trace!(peer = %peer.short(), "superseding connection");
                existing.close();
            }
        }

        let entry = Entry {
            connection: connection.clone(),
            announced: false,
        };
        match self.connections.push(peer, entry) {
            Some((replaced_peer, replaced)) if replaced_peer == peer => {
                self.report_closed(peer, &replaced);
            }
            Some((evicted_peer, evicted)) => {
                debug!(peer = %evicted_peer.short(), "connection registry full, closing least recently used");
                evicted.connection.close();
                self.report_closed(evicted_peer, &evicted);
            }
            None => {}
        }

        let _ = self.new_connections.send(connection.clone());
        connection
    }

    /// Emit `Connected` for `stable_id` if it is still the peer's registered
    /// connection. Later calls for the same connection do nothing.
    fn announce(&mut self, peer: PeerId, stable_id: usize) {
        let Some(entry) = self.connections.peek_mut(&peer) else {
            return;
        };
        if entry.announced || entry.connection.stable_id() != stable_id {
            return;
        }
        entry.announced = true;
        let _ = self.events.send(ConnectionEvent::Connected {
            peer,
            remote: entry.connection.remote_addr(),
            direction: entry.connection.direction(),
        });
    }

    /// Drop `peer` if its registered connection is `stable_id`. Returns true
    /// when it was, meaning the peer is now disconnected.
    fn forget(&mut self, peer: PeerId, stable_id: usize) -> bool {
        let matches = self
            .connections
            .peek(&peer)
            .is_some_and(|entry| entry.connection.stable_id() == stable_id);
        if !matches {
            return false;
        }
        if let Some(entry) = self.connections.pop(&peer) {
            self.report_closed(peer, &entry);
        }
        true
    }

    fn report_closed(&self, peer: PeerId, entry: &Entry) {
        if entry.announced {
            let _ = self.events.send(ConnectionEvent::Closed { peer });
        }
    }
}

// ============================================================================
// RpcNode Handle (cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct RpcNode {
    endpoint: Endpoint,
    local: PeerAddress,
    cmd_tx: mpsc::Sender<RpcCommand>,
    events: broadcast::Sender<ConnectionEvent>,
    connect_timeout: Duration,
    rpc_timeout: Duration,
}

impl RpcNode {
    /// Spawn the registry actor. Every connection registered from now on, in
    /// either direction, is also sent to the returned receiver so the caller
    /// can serve it and [`announce`](Self::announce) it once it is wired up.
    pub fn spawn(
        endpoint: Endpoint,
        local: PeerAddress,
        connect_timeout: Duration,
        rpc_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Connection>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (new_tx, new_rx) = mpsc::unbounded_channel();

        let cache_cap = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        let actor = RpcActor {
            local: local.peer,
            connections: LruCache::new(cache_cap),
            events: events.clone(),
            new_connections: new_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        let node = Self {
            endpoint,
            local,
            cmd_tx,
            events,
            connect_timeout,
            rpc_timeout,
        };
        (node, new_rx)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Publish `Connected` for a registered connection. Nothing is sent if
    /// it has been replaced or already announced.
    pub async fn announce(&self, connection: &Connection) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::Announce {
                peer: connection.peer(),
                stable_id: connection.stable_id(),
            })
            .await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RpcCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Return the live connection to `target.peer`, dialing if there is none.
    pub async fn connect(&self, target: &PeerAddress, deadline: &Deadline) -> Result<Connection> {
        deadline.check()?;
        if target.peer == self.local.peer {
            return Err(Error::Handshake("refusing to connect to self".into()));
        }

        let peer = target.peer;
        if let Some(conn) = self
            .request(|reply| RpcCommand::Lookup { peer, reply })
            .await?
        {
            return Ok(conn);
        }

        let conn = deadline
            .run(dial(&self.endpoint, target, self.connect_timeout))
            .await??;
        self.register(conn).await
    }

    /// Add an established connection to the registry.
    pub async fn register(&self, connection: Connection) -> Result<Connection> {
        self.request(|reply| RpcCommand::Register { connection, reply })
            .await
    }

    /// Report that `connection` has closed. Returns true if it was the
    /// peer's registered connection.
    pub async fn connection_closed(&self, connection: &Connection) -> bool {
        let peer = connection.peer();
        let stable_id = connection.stable_id();
        self.request(|reply| RpcCommand::Closed {
            peer,
            stable_id,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(RpcCommand::Peers).await.unwrap_or_default()
    }

    async fn rpc_raw(&self, to: &PeerAddress, request: RpcRequest) -> anyhow::Result<RpcResponse> {
        // A closed registry entry counts as absent, so a broken connection
        // is redialed here on next use.
        let conn = self.connect(to, &Deadline::none()).await?;
        self.rpc_inner(&conn, request).await
    }

    async fn rpc_inner(&self, conn: &Connection, request: RpcRequest) -> anyhow::Result<RpcResponse> {
        tokio::time::timeout(self.rpc_timeout, async {
            let (mut send, mut recv) = conn
                .quic()
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;

            let request_bytes = messages::serialize(&request).context("failed to serialize request")?;
            if request_bytes.len() > MAX_REQUEST_SIZE {
                bail!(
                    "request too large: {} bytes (max {})",
                    request_bytes.len(),
                    MAX_REQUEST_SIZE
                );
            }
            write_frame(&mut send, &request_bytes).await?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_RESPONSE_SIZE {
                warn!(
                    peer = %conn.peer().short(),
                    size = len,
                    max = MAX_RESPONSE_SIZE,
                    "peer sent oversized response"
                );
                bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;
            messages::deserialize_bounded(&response_bytes).context("failed to deserialize response")
        })
        .await
        .context("RPC timed out")?
    }

    async fn dht_rpc(&self, to: &PeerAddress, request: DhtRequest) -> anyhow::Result<DhtResponse> {
        match self.rpc_raw(to, RpcRequest::Dht(request)).await? {
            RpcResponse::Dht(DhtResponse::Error { message }) => bail!("DHT error: {message}"),
            RpcResponse::Dht(response) => Ok(response),
            RpcResponse::Error { message } => bail!("RPC error: {message}"),
            other => bail!("unexpected response to DHT request: {other:?}"),
        }
    }
}

async fn write_frame(send: &mut quinn::SendStream, body: &[u8]) -> anyhow::Result<()> {
    let len = u32::try_from(body.len()).context("frame length overflows u32")?;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(body).await?;
    send.finish()?;
    Ok(())
}

#[async_trait]
impl DhtRpc for RpcNode {
    async fn find_node(&self, to: &PeerAddress, target: Key) -> anyhow::Result<Vec<PeerAddress>> {
        let request = DhtRequest::FindNode {
            from: self.local,
            target,
        };
        match self.dht_rpc(to, request).await? {
            DhtResponse::Nodes(mut nodes) => {
                nodes.truncate(MAX_PEERS_PER_RESPONSE);
                Ok(nodes)
            }
            other => bail!("unexpected response to FIND_NODE: {other:?}"),
        }
    }

    async fn get_providers(
        &self,
        to: &PeerAddress,
        key: ContentKey,
    ) -> anyhow::Result<(Vec<PeerAddress>, Vec<PeerAddress>)> {
        let request = DhtRequest::GetProviders {
            from: self.local,
            key,
        };
        match self.dht_rpc(to, request).await? {
            DhtResponse::Providers {
                mut providers,
                mut closer,
            } => {
                providers.truncate(MAX_PEERS_PER_RESPONSE);
                closer.truncate(MAX_PEERS_PER_RESPONSE);
                // A node bound to a wildcard address lists its own record
                // with that address; substitute the one we reached it on.
                for provider in providers.iter_mut().filter(|p| p.peer == to.peer) {
                    *provider = provider.with_observed_ip(to.addr.ip());
                }
                Ok((providers, closer))
            }
            other => bail!("unexpected response to GET_PROVIDERS: {other:?}"),
        }
    }

    async fn add_provider(&self, to: &PeerAddress, key: ContentKey) -> anyhow::Result<()> {
        let request = DhtRequest::AddProvider {
            from: self.local,
            key,
        };
        match self.dht_rpc(to, request).await? {
            DhtResponse::Ack => Ok(()),
            other => bail!("unexpected response to ADD_PROVIDER: {other:?}"),
        }
    }
}

#[async_trait]
impl FloodSubRpc for RpcNode {
    async fn send_flood(&self, to: &PeerAddress, message: Message) -> anyhow::Result<()> {
        match self.rpc_raw(to, RpcRequest::FloodSub(message)).await? {
            RpcResponse::FloodSubAck => Ok(()),
            RpcResponse::Error { message } => bail!("FloodSub error: {message}"),
            other => bail!("unexpected response to FloodSub message: {other:?}"),
        }
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Accept request streams on `connection` until it closes or `shutdown`
/// fires. Each stream is handled on its own task.
pub async fn serve_connection<N>(
    connection: Connection,
    dht: DhtNode<N>,
    floodsub: FloodSub<N>,
    shutdown: CancellationToken,
) where
    N: DhtRpc + FloodSubRpc,
{
    let peer = connection.peer();
    let remote = connection.remote_addr();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = connection.quic().accept_bi() => accepted,
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(peer = %peer.short(), remote = %remote, "connection closed");
                break;
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(peer = %peer.short(), remote = %remote, "connection idle timeout");
                break;
            }
            Err(e) => {
                debug!(peer = %peer.short(), remote = %remote, error = %e, "connection lost");
                break;
            }
        };

        let dht = dht.clone();
        let floodsub = floodsub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(dht, floodsub, stream, peer, remote).await {
                debug!(peer = %peer.short(), error = ?e, "stream error");
            }
        });
    }
}

async fn handle_stream<N>(
    dht: DhtNode<N>,
    floodsub: FloodSub<N>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    verified_peer: PeerId,
    remote: SocketAddr,
) -> anyhow::Result<()>
where
    N: DhtRpc + FloodSubRpc,
{
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .context("request header read timed out")??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(
            remote = %remote,
            size = len,
            max = MAX_REQUEST_SIZE,
            "rejecting oversized request"
        );
        let response = RpcResponse::Error {
            message: format!("request too large: {len} bytes (max {MAX_REQUEST_SIZE})"),
        };
        return write_frame(&mut send, &messages::serialize(&response)?).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .context("request body read timed out")??;

    let mut request: RpcRequest =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    if let Some(claimed) = request.claimed_peer() {
        if claimed != verified_peer {
            warn!(
                remote = %remote,
                claimed = %claimed.short(),
                verified = %verified_peer.short(),
                "rejecting request: sender does not match connection identity"
            );
            let response = RpcResponse::Error {
                message: "sender does not match connection identity".to_string(),
            };
            return write_frame(&mut send, &messages::serialize(&response)?).await;
        }
    }

    if let RpcRequest::Dht(dht_request) = &mut request {
        let from = dht_request.from_mut();
        *from = from.with_observed_ip(remote.ip());
    }

    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        handle_rpc_request(&dht, &floodsub, request, verified_peer),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            RpcResponse::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };

    let response_bytes = messages::serialize(&response).context("failed to serialize response")?;
    write_frame(&mut send, &response_bytes).await
}

async fn handle_rpc_request<N>(
    dht: &DhtNode<N>,
    floodsub: &FloodSub<N>,
    request: RpcRequest,
    from_peer: PeerId,
) -> RpcResponse
where
    N: DhtRpc + FloodSubRpc,
{
    match request {
        RpcRequest::Dht(request) => RpcResponse::Dht(handle_dht_rpc(dht, request).await),
        RpcRequest::FloodSub(message) => match floodsub.handle_message(from_peer, message).await {
            Ok(()) => RpcResponse::FloodSubAck,
            Err(e) => {
                debug!(from = %from_peer.short(), error = %e, "rejected flooded message");
                RpcResponse::Error {
                    message: format!("FloodSub error: {e}"),
                }
            }
        },
    }
}

async fn handle_dht_rpc<N: DhtRpc>(dht: &DhtNode<N>, request: DhtRequest) -> DhtResponse {
    match request {
        DhtRequest::FindNode { from, target } => {
            trace!(from = %from.peer.short(), "handling FIND_NODE");
            DhtResponse::Nodes(dht.handle_find_node(from, target).await)
        }
        DhtRequest::GetProviders { from, key } => {
            trace!(from = %from.peer.short(), key = %key, "handling GET_PROVIDERS");
            let (providers, closer) = dht.handle_get_providers(from, key).await;
            DhtResponse::Providers { providers, closer }
        }
        DhtRequest::AddProvider { from, key } => {
            trace!(from = %from.peer.short(), key = %key, "handling ADD_PROVIDER");
            dht.handle_add_provider(from, key).await;
            DhtResponse::Ack
        }
    }
}
