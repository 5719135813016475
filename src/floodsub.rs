//! # FloodSub
//!
//! Flood-fill publish/subscribe. Every node forwards each message it has not
//! seen before to all of its connections except the one it arrived on, so a
//! message reaches every subscriber in the connected swarm exactly once.
//!
//! ## Architecture
//!
//! - [`FloodSub`]: public handle (cheap to clone)
//! - `FloodSubActor`: owns subscriptions, the seen cache and the per-peer
//!   outbound queues. A heartbeat in the same `select!` sweeps old ids.
//! - One writer task per connected peer drains that peer's bounded queue, so
//!   a slow link never blocks the others and per-link order is kept.
//!
//! Messages are signed by their publisher and checked by every hop before
//! they touch the actor (see [`Message::verify`]).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerAddress, PeerId};
use crate::messages::{is_valid_topic, Message, MessageError, MessageId, MAX_MESSAGE_SIZE};
use crate::protocols::FloodSubRpc;

pub const DEFAULT_SEEN_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

const COMMAND_CHANNEL_SIZE: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodSubConfig {
    pub max_message_size: usize,
    pub seen_cache_size: usize,
    #[serde(rename = "seen_ttl_ms", with = "duration_ms")]
    pub seen_ttl: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub outbound_queue_size: usize,
    #[serde(rename = "send_timeout_ms", with = "duration_ms")]
    pub send_timeout: Duration,
    pub send_retries: u32,
}

impl Default for FloodSubConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
            seen_ttl: DEFAULT_SEEN_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            send_timeout: Duration::from_secs(5),
            send_retries: 2,
        }
    }
}

impl FloodSubConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_message_size > 0, "max_message_size must be > 0");
        ensure!(
            self.max_message_size <= MAX_MESSAGE_SIZE,
            "max_message_size must not exceed {MAX_MESSAGE_SIZE}"
        );
        ensure!(self.seen_cache_size > 0, "seen_cache_size must be > 0");
        ensure!(self.outbound_queue_size > 0, "outbound_queue_size must be > 0");
        ensure!(!self.seen_ttl.is_zero(), "seen_ttl_ms must be > 0");
        ensure!(!self.heartbeat_interval.is_zero(), "heartbeat_interval_ms must be > 0");
        ensure!(!self.send_timeout.is_zero(), "send_timeout_ms must be > 0");
        Ok(())
    }
}

/// Stream of messages for one topic.
///
/// Ends with `None` after [`FloodSub::unsubscribe`] or shutdown.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

enum Command {
    Subscribe(String, oneshot::Sender<Subscription>),
    Unsubscribe(String),
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId>>),
    Incoming(PeerId, Message),
    PeerConnected(PeerAddress),
    PeerDisconnected(PeerId),
    #[cfg(test)]
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    #[cfg(test)]
    Subscriptions(oneshot::Sender<Vec<String>>),
    Quit,
}

// ============================================================================
// FloodSub Handle
// ============================================================================

pub struct FloodSub<N: FloodSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    config: Arc<FloodSubConfig>,
    _network: PhantomData<N>,
}

impl<N: FloodSubRpc> Clone for FloodSub<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            config: self.config.clone(),
            _network: PhantomData,
        }
    }
}

impl<N: FloodSubRpc> FloodSub<N> {
    pub fn spawn(network: N, keypair: Keypair, config: FloodSubConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let config = Arc::new(config);
        let actor = FloodSubActor::new(Arc::new(network), keypair, config.clone());
        tokio::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            config,
            _network: PhantomData,
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Shutdown)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if !is_valid_topic(topic) {
            return Err(Error::InvalidMessage(format!("invalid topic {topic:?}")));
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Subscribe(topic.to_string(), tx)).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.send(Command::Unsubscribe(topic.to_string())).await
    }

    /// Sign and flood `payload` on `topic`.
    ///
    /// Local subscribers always receive the message. Returns
    /// [`Error::NotConnected`] when there was no peer to send it to.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId> {
        if !is_valid_topic(topic) {
            return Err(Error::InvalidMessage(format!("invalid topic {topic:?}")));
        }
        if payload.len() > self.config.max_message_size {
            return Err(Error::InvalidMessage(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                self.config.max_message_size
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Publish(topic.to_string(), payload, tx)).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Accept a message relayed by the directly connected peer `from`.
    ///
    /// Verification runs on the caller's task; only valid messages reach the
    /// actor. Duplicates are not an error.
    pub async fn handle_message(
        &self,
        from: PeerId,
        message: Message,
    ) -> std::result::Result<(), MessageError> {
        message.verify(self.config.max_message_size)?;
        let _ = self.send(Command::Incoming(from, message)).await;
        Ok(())
    }

    pub async fn peer_connected(&self, peer: PeerAddress) {
        let _ = self.send(Command::PeerConnected(peer)).await;
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.send(Command::PeerDisconnected(peer)).await;
    }

    #[cfg(test)]
    pub(crate) async fn connected_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::ConnectedPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) async fn subscriptions(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Subscriptions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// FloodSub Actor
// ============================================================================

struct FloodSubActor<N: FloodSubRpc> {
    network: Arc<N>,
    keypair: Keypair,
    local: PeerId,
    config: Arc<FloodSubConfig>,
    seqno: u64,
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    /// Message id -> when it was first seen.
    seen: LruCache<MessageId, Instant>,
    outbound: HashMap<PeerId, mpsc::Sender<Message>>,
}

impl<N: FloodSubRpc> FloodSubActor<N> {
    fn new(network: Arc<N>, keypair: Keypair, config: Arc<FloodSubConfig>) -> Self {
        let seen_cap = NonZeroUsize::new(config.seen_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            network,
            local: keypair.peer_id(),
            keypair,
            // Random start so a restarted node does not reuse message ids.
            seqno: rand::random::<u64>() >> 1,
            subscriptions: HashMap::new(),
            seen: LruCache::new(seen_cap),
            outbound: HashMap::new(),
            config,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Subscribe(topic, reply) => {
                            let _ = reply.send(self.subscribe(topic));
                        }
                        Command::Unsubscribe(topic) => {
                            if let Some(handles) = self.subscriptions.remove(&topic) {
                                debug!(topic = %topic, handles = handles.len(), "unsubscribed");
                            }
                        }
                        Command::Publish(topic, payload, reply) => {
                            let _ = reply.send(self.publish(&topic, payload));
                        }
                        Command::Incoming(from, message) => self.handle_incoming(from, message),
                        Command::PeerConnected(peer) => self.add_peer(peer),
                        Command::PeerDisconnected(peer) => {
                            if self.outbound.remove(&peer).is_some() {
                                debug!(peer = %peer.short(), "floodsub peer removed");
                            }
                        }
                        #[cfg(test)]
                        Command::ConnectedPeers(reply) => {
                            let _ = reply.send(self.outbound.keys().copied().collect());
                        }
                        #[cfg(test)]
                        Command::Subscriptions(reply) => {
                            let _ = reply.send(self.subscriptions.keys().cloned().collect());
                        }
                        Command::Quit => {
                            debug!("floodsub actor shutting down");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }
    }

    fn subscribe(&mut self, topic: String) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.entry(topic.clone()).or_default().push(tx);
        debug!(topic = %topic, "subscribed");
        Subscription { topic, rx }
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<MessageId> {
        self.seqno = self.seqno.wrapping_add(1);
        let message = Message::new_signed(&self.keypair, topic, self.seqno, payload);
        let id = message.id;

        self.mark_seen(id, Instant::now());
        self.deliver_local(&message);

        if self.outbound.is_empty() {
            debug!(topic = %topic, id = %id, "published with no connected peers");
            return Err(Error::NotConnected);
        }
        let queued = self.forward(&message, None);
        trace!(topic = %topic, id = %id, queued, "published");
        Ok(id)
    }

    fn handle_incoming(&mut self, from: PeerId, message: Message) {
        if !self.mark_seen(message.id, Instant::now()) {
            trace!(from = %from.short(), id = %message.id, "duplicate message dropped");
            return;
        }
        if message.sender == self.local {
            // Our own message came back after its id aged out.
            return;
        }
        self.deliver_local(&message);
        let queued = self.forward(&message, Some(from));
        trace!(
            from = %from.short(),
            sender = %message.sender.short(),
            topic = %message.topic,
            queued,
            "relayed message"
        );
    }

    /// Record `id` as seen. Returns false if it was already seen within `seen_ttl`.
    fn mark_seen(&mut self, id: MessageId, now: Instant) -> bool {
        if let Some(first_seen) = self.seen.get(&id) {
            if now.saturating_duration_since(*first_seen) < self.config.seen_ttl {
                return false;
            }
        }
        self.seen.put(id, now);
        true
    }

    fn deliver_local(&mut self, message: &Message) {
        if let Some(handles) = self.subscriptions.get_mut(&message.topic) {
            handles.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    fn forward(&self, message: &Message, except: Option<PeerId>) -> usize {
        let mut queued = 0;
        for (peer, queue) in &self.outbound {
            if Some(*peer) == except {
                continue;
            }
            match queue.try_send(message.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(peer = %peer.short(), id = %message.id, "outbound queue full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(peer = %peer.short(), "outbound writer gone");
                }
            }
        }
        queued
    }

    fn add_peer(&mut self, peer: PeerAddress) {
        if self
            .outbound
            .get(&peer.peer)
            .is_some_and(|queue| !queue.is_closed())
        {
            return;
        }
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_size);
        tokio::spawn(run_writer(
            self.network.clone(),
            peer,
            rx,
            self.config.send_timeout,
            self.config.send_retries,
        ));
        self.outbound.insert(peer.peer, tx);
        debug!(peer = %peer.peer.short(), addr = %peer.addr, "floodsub peer added");
    }

    fn heartbeat(&mut self) {
        let now = Instant::now();
        let ttl = self.config.seen_ttl;
        let expired: Vec<MessageId> = self
            .seen
            .iter()
            .filter(|(_, first_seen)| now.saturating_duration_since(**first_seen) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.seen.pop(id);
        }
        if !expired.is_empty() {
            trace!(expired = expired.len(), "swept seen cache");
        }
    }
}

/// Drain one peer's queue until the actor drops the sender.
async fn run_writer<N: FloodSubRpc>(
    network: Arc<N>,
    peer: PeerAddress,
    mut queue: mpsc::Receiver<Message>,
    send_timeout: Duration,
    send_retries: u32,
) {
    while let Some(message) = queue.recv().await {
        let mut delivered = false;
        for attempt in 0..=send_retries {
            match tokio::time::timeout(send_timeout, network.send_flood(&peer, message.clone())).await {
                Ok(Ok(())) => {
                    delivered = true;
                    break;
                }
                Ok(Err(e)) => {
                    trace!(peer = %peer.peer.short(), attempt, error = %e, "flood send failed");
                }
                Err(_) => {
                    trace!(peer = %peer.peer.short(), attempt, "flood send timed out");
                }
            }
        }
        if !delivered {
            warn!(peer = %peer.peer.short(), id = %message.id, "giving up on flood send");
        }
    }
    trace!(peer = %peer.peer.short(), "floodsub writer stopped");
}
