//! Protocol traits for the networking layer.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | DHT | [`DhtRpc`] | Closest-peer walks and provider records |
//! | FloodSub | [`FloodSubRpc`] | Forwarding flooded messages to one peer |
//!
//! The DHT and FloodSub actors only see these traits. `RpcNode` implements
//! them over QUIC and the test suites implement them over in-memory maps.

use anyhow::Result;
use async_trait::async_trait;

use crate::dht::Key;
use crate::identity::{ContentKey, PeerAddress};
use crate::messages::Message;

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ask `to` for the peers it knows closest to `target`.
    async fn find_node(&self, to: &PeerAddress, target: Key) -> Result<Vec<PeerAddress>>;

    /// Ask `to` for providers of `key` plus closer peers.
    async fn get_providers(
        &self,
        to: &PeerAddress,
        key: ContentKey,
    ) -> Result<(Vec<PeerAddress>, Vec<PeerAddress>)>;

    /// Tell `to` that the local node provides `key`.
    async fn add_provider(&self, to: &PeerAddress, key: ContentKey) -> Result<()>;
}

#[async_trait]
pub trait FloodSubRpc: Send + Sync + 'static {
    /// Deliver one message to one directly connected peer.
    async fn send_flood(&self, to: &PeerAddress, message: Message) -> Result<()>;
}
