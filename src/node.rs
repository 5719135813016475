//! # High-Level Node API
//!
//! A [`Node`] ties the transport, the content routing table and the broadcast
//! channel together behind one handle.
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0").await?;
//! node.bootstrap(&"/ip4/10.0.0.1/udp/9876/id/ab12...".parse()?).await?;
//!
//! let mut chat = node.subscribe("swarmlink-chat").await?;
//! node.publish("swarmlink-chat", b"hello".to_vec()).await?;
//! while let Some(msg) = chat.next().await {
//!     println!("{}: {:?}", msg.sender.short(), msg.payload);
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **transport**: QUIC endpoint and accept loop
//! - **RpcNode**: connection registry and request framing
//! - **DhtNode**: provider records and iterative lookups
//! - **FloodSub**: flood-fill broadcast
//!
//! A supervisor task receives every registered connection, inbound or
//! outbound, wires it into the DHT and FloodSub, announces it and serves its
//! request streams until it closes.

use std::net::SocketAddr;
use std::time::Duration;

use quinn::Endpoint;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::Deadline;
use crate::config::NodeConfig;
use crate::crypto::{create_client_config, create_server_config, generate_ed25519_cert};
use crate::dht::{DhtNode, DhtStats};
use crate::error::{Error, Result};
use crate::floodsub::{FloodSub, Subscription};
use crate::identity::{ContentKey, Keypair, PeerAddress, PeerId};
use crate::messages::MessageId;
use crate::rpc::{serve_connection, RpcNode};
use crate::transport::{self, Connection, ConnectionEvent, ListenHandle};

const ACCEPT_CHANNEL_SIZE: usize = 64;

/// How long [`Node::shutdown`] waits for connections to drain.
const SHUTDOWN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Node {
    keypair: Keypair,
    endpoint: Endpoint,
    local: PeerAddress,
    config: NodeConfig,
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    floodsub: FloodSub<RpcNode>,
    listener: ListenHandle,
    supervisor: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Node {
    /// Bind with a fresh identity and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_keypair(addr, Keypair::generate()?).await
    }

    pub async fn bind_with_keypair(addr: &str, keypair: Keypair) -> Result<Self> {
        Self::bind_with_config(addr, keypair, NodeConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, keypair: Keypair, config: NodeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Decode(format!("invalid socket address {addr:?}: {e}")))?;

        let (server_certs, server_key) = key_material(generate_ed25519_cert(&keypair))?;
        let (client_certs, client_key) = key_material(generate_ed25519_cert(&keypair))?;
        let server_config = key_material(create_server_config(server_certs, server_key))?;
        let client_config = key_material(create_client_config(client_certs, client_key))?;

        let endpoint = transport::bind_endpoint(addr, server_config, client_config)?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;
        let local = PeerAddress::new(local_addr, keypair.peer_id());

        let (rpc, registered) =
            RpcNode::spawn(endpoint.clone(), local, config.connect_timeout, config.rpc_timeout);
        let dht = DhtNode::new(local, rpc.clone(), config.dht.clone());
        let floodsub = FloodSub::spawn(rpc.clone(), keypair.clone(), config.floodsub.clone());

        let shutdown = CancellationToken::new();
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_CHANNEL_SIZE);
        let listener = transport::listen(
            endpoint.clone(),
            config.connect_timeout,
            accepted_tx,
            shutdown.clone(),
        )
        .map_err(|source| Error::Bind { addr, source })?;

        let supervisor = tokio::spawn(supervise(
            rpc.clone(),
            dht.clone(),
            floodsub.clone(),
            accepted_rx,
            registered,
            shutdown.clone(),
        ));

        info!(addr = %local, "node listening");

        Ok(Self {
            keypair,
            endpoint,
            local,
            config,
            rpc,
            dht,
            floodsub,
            listener,
            supervisor,
            shutdown,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Dialable address of this node, in the form peers expect for
    /// [`Node::connect`] and [`Node::bootstrap`].
    pub fn peer_address(&self) -> PeerAddress {
        self.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub async fn connect(&self, target: &PeerAddress) -> Result<Connection> {
        self.connect_with(target, &Deadline::none()).await
    }

    /// Return the live connection to `target.peer`, dialing if needed. The
    /// peer is known to the routing table and the broadcast channel by the
    /// time this returns.
    pub async fn connect_with(&self, target: &PeerAddress, deadline: &Deadline) -> Result<Connection> {
        let connection = self.rpc.connect(target, deadline).await?;
        let observed = PeerAddress::new(connection.remote_addr(), connection.peer());
        self.dht.observe(observed).await;
        self.floodsub.peer_connected(observed).await;
        Ok(connection)
    }

    /// Subscribe to connection lifecycle events. Only events sent after this
    /// call are received.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.rpc.subscribe_events()
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.rpc.connected_peers().await
    }

    // ========================================================================
    // Content Routing
    // ========================================================================

    /// Connect to `seed` and fill the routing table with a self-lookup.
    /// Returns the number of peers now known.
    pub async fn bootstrap(&self, seed: &PeerAddress) -> Result<usize> {
        self.connect(seed).await?;
        let known = self.dht.bootstrap(*seed).await?;
        info!(seed = %seed.peer.short(), known, "bootstrapped");
        Ok(known)
    }

    pub async fn provide(&self, key: ContentKey, announce: bool) -> Result<()> {
        self.dht.provide(key, announce).await
    }

    pub async fn provide_with(&self, key: ContentKey, announce: bool, deadline: &Deadline) -> Result<()> {
        self.dht.provide_with(key, announce, deadline).await
    }

    pub async fn find_providers(&self, key: ContentKey, limit: usize) -> Result<Vec<PeerAddress>> {
        self.dht.find_providers(key, limit).await
    }

    pub async fn find_providers_with(
        &self,
        key: ContentKey,
        limit: usize,
        deadline: &Deadline,
    ) -> Result<Vec<PeerAddress>> {
        self.dht.find_providers_with(key, limit, deadline).await
    }

    /// Announce interest in `topic` and connect to up to `limit` other
    /// providers of it. Returns the providers that are now connected.
    ///
    /// A lonely node (nobody answered the announcement) still keeps its local
    /// record, so later joiners that ask it directly find it.
    pub async fn rendezvous(&self, topic: &str, limit: usize) -> Result<Vec<PeerAddress>> {
        let key = ContentKey::for_topic(topic);
        match self.dht.provide(key, true).await {
            Ok(()) | Err(Error::LookupTimeout) => {}
            Err(e) => return Err(e),
        }

        let providers = self.dht.find_providers(key, limit.saturating_add(1)).await?;
        let mut connected = Vec::new();
        for provider in providers.into_iter().filter(|p| p.peer != self.local.peer) {
            if connected.len() >= limit {
                break;
            }
            match self.connect(&provider).await {
                Ok(_) => connected.push(provider),
                Err(e) => {
                    debug!(peer = %provider.peer.short(), error = %e, "rendezvous connect failed");
                }
            }
        }
        debug!(topic, connected = connected.len(), "rendezvous complete");
        Ok(connected)
    }

    pub async fn dht_stats(&self) -> Result<DhtStats> {
        self.dht.stats().await
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.floodsub.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.floodsub.unsubscribe(topic).await
    }

    /// Flood `payload` to every subscriber of `topic`, local ones included.
    /// [`Error::NotConnected`] means only local subscribers received it.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<MessageId> {
        self.floodsub.publish(topic, payload.into()).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the actors and close every connection. Calls after the first are
    /// no-ops.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.listener.close();

        self.floodsub.quit().await;
        self.dht.quit().await;
        self.rpc.quit().await;

        self.endpoint.close(0u32.into(), b"shutdown");
        if tokio::time::timeout(SHUTDOWN_IDLE_TIMEOUT, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("endpoint did not drain before shutdown timeout");
        }
        info!(peer = %self.local.peer.short(), "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.supervisor.abort();
    }
}

// ============================================================================
// Connection Supervisor
// ============================================================================

async fn supervise(
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    floodsub: FloodSub<RpcNode>,
    mut accepted: mpsc::Receiver<Connection>,
    mut registered: mpsc::UnboundedReceiver<Connection>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(connection) = accepted.recv() => {
                if let Err(e) = rpc.register(connection).await {
                    debug!(error = %e, "dropping inbound connection");
                }
            }
            Some(connection) = registered.recv() => {
                tokio::spawn(run_connection(
                    rpc.clone(),
                    dht.clone(),
                    floodsub.clone(),
                    connection,
                    shutdown.clone(),
                ));
            }
            else => break,
        }
    }
    debug!("connection supervisor stopped");
}

async fn run_connection(
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    floodsub: FloodSub<RpcNode>,
    connection: Connection,
    shutdown: CancellationToken,
) {
    let peer = connection.peer();
    let remote = connection.remote_addr();
    let observed = PeerAddress::new(remote, peer);

    dht.observe(observed).await;
    floodsub.peer_connected(observed).await;
    debug!(peer = %peer.short(), remote = %remote, direction = ?connection.direction(), "connection ready");
    rpc.announce(&connection).await;

    serve_connection(connection.clone(), dht, floodsub.clone(), shutdown.clone()).await;

    if shutdown.is_cancelled() {
        return;
    }
    if rpc.connection_closed(&connection).await {
        floodsub.peer_disconnected(peer).await;
        debug!(peer = %peer.short(), remote = %remote, "peer disconnected");
    } else if !connection.is_closed() {
        warn!(peer = %peer.short(), "stopped serving a connection that is still open");
    }
}

/// Certificate and TLS setup happens before any peer is involved, so every
/// failure is reported against the local key.
fn key_material<T>(built: anyhow::Result<T>) -> Result<T> {
    built.map_err(|e| Error::KeyGen(format!("{e:#}")))
}
