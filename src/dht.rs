//! # Content Routing Table
//!
//! Kademlia-style DHT mapping [`ContentKey`]s to the peers that provide them.
//!
//! ## Architecture
//!
//! - [`DhtNode`]: public handle (cheap to clone)
//! - `DhtActor`: owns the routing table, provider store and the set of keys
//!   this node re-announces. Mutated only by sequential command processing.
//! - A maintenance task sweeps expired records, refreshes idle buckets and
//!   re-announces provided keys.
//!
//! Lookups run on the caller's task and reach the network only through
//! [`DhtRpc`], so the same code drives QUIC peers and in-memory test networks.
//!
//! ## Routing
//!
//! 256 buckets indexed by the number of leading zero bits of the XOR distance
//! to the local PeerId. A bucket holds at most `k` entries ordered least
//! recently seen first; on overflow the least recently seen entry is evicted.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure};
use lru::LruCache;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cancel::Deadline;
use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::identity::{distance_cmp, ContentKey, PeerAddress, PeerId};
use crate::protocols::DhtRpc;

/// 256-bit point in the shared PeerId/ContentKey keyspace.
pub type Key = [u8; 32];

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;

/// Default number of parallel queries per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// Distinct keys held in the provider store before LRU eviction.
pub const MAX_PROVIDER_KEYS: usize = 10_000;

/// Peers or providers accepted from a single response.
pub const MAX_PEERS_PER_RESPONSE: usize = 100;

const MAX_LOOKUP_ROUNDS: usize = 20;
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_CHANNEL_SIZE: usize = 256;

fn short(key: &Key) -> String {
    hex::encode(&key[..8])
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    #[serde(rename = "provider_ttl_ms", with = "duration_ms")]
    pub provider_ttl: Duration,
    #[serde(rename = "reprovide_interval_ms", with = "duration_ms")]
    pub reprovide_interval: Duration,
    #[serde(rename = "lookup_timeout_ms", with = "duration_ms")]
    pub lookup_timeout: Duration,
    #[serde(rename = "query_timeout_ms", with = "duration_ms")]
    pub query_timeout: Duration,
    pub query_retries: u32,
    pub max_providers_per_key: usize,
    #[serde(rename = "bucket_refresh_interval_ms", with = "duration_ms")]
    pub bucket_refresh_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            reprovide_interval: Duration::from_secs(12 * 60 * 60),
            lookup_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(3),
            query_retries: 1,
            max_providers_per_key: 20,
            bucket_refresh_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.k > 0, "k must be > 0");
        ensure!(self.alpha > 0, "alpha must be > 0");
        ensure!(
            self.alpha <= self.k,
            "alpha ({}) must not exceed k ({})",
            self.alpha,
            self.k
        );
        ensure!(self.max_providers_per_key > 0, "max_providers_per_key must be > 0");
        for (name, value) in [
            ("provider_ttl_ms", self.provider_ttl),
            ("reprovide_interval_ms", self.reprovide_interval),
            ("lookup_timeout_ms", self.lookup_timeout),
            ("query_timeout_ms", self.query_timeout),
            ("bucket_refresh_interval_ms", self.bucket_refresh_interval),
        ] {
            ensure!(!value.is_zero(), "{name} must be > 0");
        }
        ensure!(
            self.reprovide_interval < self.provider_ttl,
            "reprovide_interval_ms must be shorter than provider_ttl_ms"
        );
        Ok(())
    }
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Clone, Debug)]
struct RoutingEntry {
    addr: PeerAddress,
    last_seen: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BucketInsert {
    Inserted,
    Refreshed,
    Evicted(PeerAddress),
}

#[derive(Debug)]
struct RoutingBucket {
    /// Least recently seen first.
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

impl RoutingBucket {
    fn new(now: Instant) -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: now,
        }
    }

    fn touch(&mut self, addr: PeerAddress, now: Instant, k: usize) -> BucketInsert {
        self.last_refresh = now;
        let fresh = RoutingEntry {
            addr,
            last_seen: now,
        };

        if let Some(pos) = self.entries.iter().position(|e| e.addr.peer == addr.peer) {
            self.entries.remove(pos);
            self.entries.push(fresh);
            return BucketInsert::Refreshed;
        }

        let outcome = if self.entries.len() >= k {
            BucketInsert::Evicted(self.entries.remove(0).addr)
        } else {
            BucketInsert::Inserted
        };
        self.entries.push(fresh);
        outcome
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.addr.peer != peer);
        self.entries.len() != before
    }

    fn is_stale(&self, threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_refresh) > threshold
    }
}

/// Index of the first bit where `self_id` and `other` differ.
fn bucket_index(self_id: &PeerId, other: &Key) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

/// Random key that lands in bucket `bucket_idx` relative to `self_id`.
fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> Key {
    let mut distance = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut distance);

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    self_id.xor_distance(&distance)
}

/// Closest first; equidistant entries most recently seen first.
fn rank_entries(entries: &mut [RoutingEntry], target: &Key) {
    entries.sort_by(|a, b| {
        distance_cmp(&a.addr.peer.xor_distance(target), &b.addr.peer.xor_distance(target))
            .then_with(|| b.last_seen.cmp(&a.last_seen))
    });
}

fn sort_by_distance(peers: &mut [PeerAddress], target: &Key) {
    peers.sort_by(|a, b| distance_cmp(&a.peer.xor_distance(target), &b.peer.xor_distance(target)));
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        let now = Instant::now();
        Self {
            self_id,
            k,
            buckets: (0..256).map(|_| RoutingBucket::new(now)).collect(),
        }
    }

    fn update(&mut self, addr: PeerAddress, now: Instant) -> Option<BucketInsert> {
        if addr.peer == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, addr.peer.as_bytes());
        Some(self.buckets[idx].touch(addr, now, self.k))
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        if *peer == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, peer.as_bytes());
        self.buckets[idx].remove(peer)
    }

    #[cfg(test)]
    fn get(&self, peer: &PeerId) -> Option<PeerAddress> {
        if *peer == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, peer.as_bytes());
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| &e.addr.peer == peer)
            .map(|e| e.addr)
    }

    pub fn closest(&self, target: &Key, count: usize) -> Vec<PeerAddress> {
        if count == 0 {
            return Vec::new();
        }
        let mut all: Vec<RoutingEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        rank_entries(&mut all, target);
        all.into_iter().take(count).map(|e| e.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stale_buckets(&self, threshold: Duration, now: Instant) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.is_stale(threshold, now))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_refreshed(&mut self, idx: usize, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.last_refresh = now;
        }
    }
}

// ============================================================================
// Provider Store
// ============================================================================

#[derive(Clone, Debug)]
struct ProviderRecord {
    provider: PeerAddress,
    expires_at: Instant,
}

struct ProviderStore {
    records: LruCache<ContentKey, Vec<ProviderRecord>>,
    max_per_key: usize,
}

impl ProviderStore {
    fn new(max_keys: usize, max_per_key: usize) -> Self {
        Self {
            records: LruCache::new(NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN)),
            max_per_key,
        }
    }

    fn add(&mut self, key: ContentKey, provider: PeerAddress, ttl: Duration, now: Instant) {
        let record = ProviderRecord {
            provider,
            expires_at: now + ttl,
        };

        let Some(records) = self.records.get_mut(&key) else {
            self.records.put(key, vec![record]);
            return;
        };

        records.retain(|r| r.expires_at > now);
        if let Some(existing) = records.iter_mut().find(|r| r.provider.peer == provider.peer) {
            *existing = record;
        } else if records.len() < self.max_per_key {
            records.push(record);
        } else if let Some(soonest) = records.iter_mut().min_by_key(|r| r.expires_at) {
            *soonest = record;
        }
    }

    /// Live providers for `key`. A record is absent from its expiry instant on.
    fn get(&mut self, key: &ContentKey, now: Instant) -> Vec<PeerAddress> {
        self.records
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.expires_at > now)
                    .map(|r| r.provider)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        let mut empty = Vec::new();
        for (key, records) in self.records.iter_mut() {
            let before = records.len();
            records.retain(|r| r.expires_at > now);
            removed += before - records.len();
            if records.is_empty() {
                empty.push(*key);
            }
        }
        for key in empty {
            self.records.pop(&key);
        }
        removed
    }

    fn key_count(&self) -> usize {
        self.records.len()
    }

    fn record_count(&self) -> usize {
        self.records.iter().map(|(_, records)| records.len()).sum()
    }
}

// ============================================================================
// DhtNode Handle
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub routing_peers: usize,
    pub provider_keys: usize,
    pub provider_records: usize,
    pub provided_keys: usize,
}

enum Command {
    Observe(PeerAddress),
    Remove(PeerId),
    Closest(Key, usize, oneshot::Sender<Vec<PeerAddress>>),
    AddLocalProvider {
        key: ContentKey,
        provider: PeerAddress,
        remember: bool,
    },
    LocalProviders(ContentKey, oneshot::Sender<Vec<PeerAddress>>),
    HandleFindNode(PeerAddress, Key, oneshot::Sender<Vec<PeerAddress>>),
    HandleGetProviders(
        PeerAddress,
        ContentKey,
        oneshot::Sender<(Vec<PeerAddress>, Vec<PeerAddress>)>,
    ),
    HandleAddProvider(PeerAddress, ContentKey),
    StaleBuckets(oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ProvidedKeys(oneshot::Sender<Vec<ContentKey>>),
    SweepExpired(oneshot::Sender<usize>),
    Stats(oneshot::Sender<DhtStats>),
    Quit,
}

#[derive(Clone, Copy, Debug)]
enum LookupMode {
    FindNode,
    GetProviders(ContentKey),
}

struct QueryReply {
    closer: Vec<PeerAddress>,
    providers: Vec<PeerAddress>,
}

struct LookupOutcome {
    /// Closest peers that answered, nearest first.
    closest: Vec<PeerAddress>,
    providers: Vec<PeerAddress>,
    responded: usize,
}

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerAddress,
    network: Arc<N>,
    config: Arc<DhtConfig>,
    shutdown: CancellationToken,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local,
            network: self.network.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<N: DhtRpc> DhtNode<N> {
    /// Spawn the actor and the maintenance task.
    pub fn new(local: PeerAddress, network: N, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let config = Arc::new(config);

        let actor = DhtActor {
            routing: RoutingTable::new(local.peer, config.k),
            providers: ProviderStore::new(MAX_PROVIDER_KEYS, config.max_providers_per_key),
            provided: HashSet::new(),
            config: config.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            local,
            network: Arc::new(network),
            config,
            shutdown: CancellationToken::new(),
        };
        node.spawn_maintenance();
        node
    }

    #[cfg(test)]
    pub(crate) fn local(&self) -> PeerAddress {
        self.local
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Shutdown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Insert or refresh a verified peer in the routing table.
    pub async fn observe(&self, addr: PeerAddress) {
        let _ = self.send(Command::Observe(addr)).await;
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        let _ = self.send(Command::Remove(peer)).await;
    }

    pub async fn closest_peers(&self, target: &Key, count: usize) -> Result<Vec<PeerAddress>> {
        let target = *target;
        self.request(|tx| Command::Closest(target, count, tx)).await
    }

    pub async fn handle_find_node(&self, from: PeerAddress, target: Key) -> Vec<PeerAddress> {
        self.request(|tx| Command::HandleFindNode(from, target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_get_providers(
        &self,
        from: PeerAddress,
        key: ContentKey,
    ) -> (Vec<PeerAddress>, Vec<PeerAddress>) {
        self.request(|tx| Command::HandleGetProviders(from, key, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_add_provider(&self, from: PeerAddress, key: ContentKey) {
        let _ = self.send(Command::HandleAddProvider(from, key)).await;
    }

    pub async fn stats(&self) -> Result<DhtStats> {
        self.request(Command::Stats).await
    }

    /// Drop expired provider records now instead of waiting for the sweep.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.request(Command::SweepExpired).await
    }

    pub async fn provide(&self, key: ContentKey, announce: bool) -> Result<()> {
        self.provide_with(key, announce, &Deadline::none()).await
    }

    /// Record the local node as a provider of `key`. With `announce`, also
    /// store the record on the `k` closest responders and keep re-announcing
    /// it every `reprovide_interval`.
    ///
    /// The local record is kept even when the announcement fails.
    pub async fn provide_with(
        &self,
        key: ContentKey,
        announce: bool,
        deadline: &Deadline,
    ) -> Result<()> {
        deadline.check()?;
        self.send(Command::AddLocalProvider {
            key,
            provider: self.local,
            remember: announce,
        })
        .await?;
        if !announce {
            return Ok(());
        }
        deadline.run(self.announce(key)).await?
    }

    pub async fn find_providers(&self, key: ContentKey, limit: usize) -> Result<Vec<PeerAddress>> {
        self.find_providers_with(key, limit, &Deadline::none()).await
    }

    /// Providers of `key` in discovery order, local records first, deduplicated
    /// by PeerId. An empty result is not an error.
    pub async fn find_providers_with(
        &self,
        key: ContentKey,
        limit: usize,
        deadline: &Deadline,
    ) -> Result<Vec<PeerAddress>> {
        deadline.check()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut local = self.request(|tx| Command::LocalProviders(key, tx)).await?;
        if local.len() >= limit {
            local.truncate(limit);
            return Ok(local);
        }

        let outcome = deadline
            .run(self.iterative_lookup(
                *key.as_bytes(),
                LookupMode::GetProviders(key),
                None,
                local,
                limit,
            ))
            .await??;

        let mut providers = outcome.providers;
        providers.truncate(limit);
        debug!(
            key = %short(key.as_bytes()),
            found = providers.len(),
            responded = outcome.responded,
            "provider lookup completed"
        );
        Ok(providers)
    }

    /// Iterative closest-peer walk toward `target`.
    pub async fn find_node(&self, target: Key) -> Result<Vec<PeerAddress>> {
        let outcome = self
            .iterative_lookup(target, LookupMode::FindNode, None, Vec::new(), usize::MAX)
            .await?;
        Ok(outcome.closest)
    }

    /// Join through `seed` with a self-lookup. Returns the number of peers
    /// now in the routing table.
    pub async fn bootstrap(&self, seed: PeerAddress) -> Result<usize> {
        self.observe(seed).await;
        let outcome = self
            .iterative_lookup(
                *self.local.peer.as_bytes(),
                LookupMode::FindNode,
                Some(seed),
                Vec::new(),
                usize::MAX,
            )
            .await?;
        if outcome.responded == 0 {
            return Err(Error::LookupTimeout);
        }
        let known = self.stats().await?.routing_peers;
        debug!(seed = %seed.peer.short(), known, "bootstrap complete");
        Ok(known)
    }

    pub async fn quit(&self) {
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn announce(&self, key: ContentKey) -> Result<()> {
        let outcome = self
            .iterative_lookup(*key.as_bytes(), LookupMode::FindNode, None, Vec::new(), usize::MAX)
            .await?;
        if outcome.responded == 0 {
            debug!(key = %short(key.as_bytes()), "no peer answered provider announcement lookup");
            return Err(Error::LookupTimeout);
        }

        let timeout = self.config.query_timeout;
        let mut join_set = JoinSet::new();
        for peer in outcome.closest {
            let network = self.network.clone();
            join_set.spawn(async move {
                let result = tokio::time::timeout(timeout, network.add_provider(&peer, key)).await;
                (peer, result)
            });
        }

        let mut stored = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => stored += 1,
                Ok((peer, Ok(Err(e)))) => {
                    debug!(peer = %peer.peer.short(), error = %e, "add_provider failed");
                }
                Ok((peer, Err(_))) => {
                    debug!(peer = %peer.peer.short(), "add_provider timed out");
                }
                Err(_) => {}
            }
        }

        debug!(key = %short(key.as_bytes()), stored, "announced provider record");
        Ok(())
    }

    async fn iterative_lookup(
        &self,
        target: Key,
        mode: LookupMode,
        seed: Option<PeerAddress>,
        mut providers: Vec<PeerAddress>,
        provider_limit: usize,
    ) -> Result<LookupOutcome> {
        let k = self.config.k;
        let alpha = self.config.alpha;
        let deadline = Instant::now() + self.config.lookup_timeout;

        let mut shortlist = self.closest_peers(&target, k).await?;
        if let Some(seed) = seed {
            if seed.peer != self.local.peer && !shortlist.iter().any(|p| p.peer == seed.peer) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut seen: HashSet<PeerId> = shortlist.iter().map(|p| p.peer).collect();
        seen.insert(self.local.peer);
        let mut provider_ids: HashSet<PeerId> = providers.iter().map(|p| p.peer).collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut responders: HashSet<PeerId> = HashSet::new();
        let mut failed: HashSet<PeerId> = HashSet::new();
        let mut best = shortlist.first().map(|p| p.peer.xor_distance(&target));
        let mut stalled = false;

        for round in 1..=MAX_LOOKUP_ROUNDS {
            if providers.len() >= provider_limit {
                break;
            }

            // Once a round brings nothing closer, query every remaining
            // candidate among the k closest and stop.
            let width = if stalled { k } else { alpha };
            let candidates: Vec<PeerAddress> = shortlist
                .iter()
                .take(k)
                .filter(|p| !queried.contains(&p.peer))
                .take(width)
                .copied()
                .collect();
            if candidates.is_empty() {
                break;
            }
            queried.extend(candidates.iter().map(|p| p.peer));

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let network = self.network.clone();
                let timeout = self.config.query_timeout;
                let retries = self.config.query_retries;
                join_set.spawn(async move {
                    let result =
                        query_peer(network.as_ref(), &peer, target, mode, timeout, retries).await;
                    (peer, result)
                });
            }

            let mut timed_out = false;
            loop {
                let joined = match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                    Ok(Some(joined)) => joined,
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                };
                let Ok((peer, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(reply) => {
                        responders.insert(peer.peer);
                        self.observe(peer).await;
                        for provider in reply.providers {
                            if provider_ids.insert(provider.peer) {
                                providers.push(provider);
                            }
                        }
                        for candidate in reply.closer {
                            if seen.insert(candidate.peer) {
                                shortlist.push(candidate);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(
                            peer = %peer.peer.short(),
                            error = %e,
                            "peer exhausted lookup retries, dropping from routing table"
                        );
                        failed.insert(peer.peer);
                        self.remove_peer(peer.peer).await;
                    }
                }
                if providers.len() >= provider_limit {
                    break;
                }
            }

            shortlist.retain(|p| !failed.contains(&p.peer));
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            trace!(
                target = %short(&target),
                round,
                shortlist = shortlist.len(),
                responded = responders.len(),
                "lookup round finished"
            );

            if timed_out {
                debug!(target = %short(&target), round, "lookup timed out, returning partial results");
                break;
            }
            if stalled {
                break;
            }

            let new_best = shortlist.first().map(|p| p.peer.xor_distance(&target));
            let closer = match (new_best, best) {
                (Some(new), Some(old)) => distance_cmp(&new, &old).is_lt(),
                (Some(_), None) => true,
                _ => false,
            };
            if closer {
                best = new_best;
            } else {
                stalled = true;
            }
        }

        let closest: Vec<PeerAddress> = shortlist
            .into_iter()
            .filter(|p| responders.contains(&p.peer))
            .collect();

        debug!(
            target = %short(&target),
            found = closest.len(),
            queried = queried.len(),
            responded = responders.len(),
            "iterative lookup completed"
        );

        Ok(LookupOutcome {
            closest,
            providers,
            responded: responders.len(),
        })
    }

    fn spawn_maintenance(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
            let mut refresh = tokio::time::interval(node.config.bucket_refresh_interval);
            let mut reprovide = tokio::time::interval(node.config.reprovide_interval);
            for timer in [&mut sweep, &mut refresh, &mut reprovide] {
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                timer.tick().await;
            }

            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = sweep.tick() => match node.sweep_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "swept expired provider records"),
                        Err(_) => break,
                    },
                    _ = refresh.tick() => node.refresh_stale_buckets().await,
                    _ = reprovide.tick() => node.reprovide().await,
                }
            }
            trace!("dht maintenance stopped");
        });
    }

    async fn refresh_stale_buckets(&self) {
        let Ok(stale) = self.request(Command::StaleBuckets).await else {
            return;
        };
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        for idx in stale {
            let target = random_id_for_bucket(&self.local.peer, idx);
            if let Err(e) = self.find_node(target).await {
                debug!(bucket = idx, error = %e, "bucket refresh lookup failed");
            }
            let _ = self.send(Command::MarkBucketRefreshed(idx)).await;
        }
    }

    async fn reprovide(&self) {
        let Ok(keys) = self.request(Command::ProvidedKeys).await else {
            return;
        };
        for key in keys {
            let refreshed = self
                .send(Command::AddLocalProvider {
                    key,
                    provider: self.local,
                    remember: true,
                })
                .await;
            if refreshed.is_err() {
                return;
            }
            if let Err(e) = self.announce(key).await {
                debug!(key = %short(key.as_bytes()), error = %e, "re-announce failed");
            }
        }
    }
}

async fn query_peer<N: DhtRpc>(
    network: &N,
    peer: &PeerAddress,
    target: Key,
    mode: LookupMode,
    timeout: Duration,
    retries: u32,
) -> anyhow::Result<QueryReply> {
    let mut last_error = anyhow!("query not attempted");
    for attempt in 0..=retries {
        let result = tokio::time::timeout(timeout, async {
            match mode {
                LookupMode::FindNode => network
                    .find_node(peer, target)
                    .await
                    .map(|closer| QueryReply {
                        closer,
                        providers: Vec::new(),
                    }),
                LookupMode::GetProviders(key) => network
                    .get_providers(peer, key)
                    .await
                    .map(|(providers, closer)| QueryReply { closer, providers }),
            }
        })
        .await;

        match result {
            Ok(Ok(mut reply)) => {
                reply.closer.truncate(MAX_PEERS_PER_RESPONSE);
                reply.providers.truncate(MAX_PEERS_PER_RESPONSE);
                return Ok(reply);
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => last_error = anyhow!("query timed out after {:?}", timeout),
        }
        trace!(peer = %peer.peer.short(), attempt, "lookup query failed");
    }
    Err(last_error)
}

// ============================================================================
// Actor
// ============================================================================

struct DhtActor {
    routing: RoutingTable,
    providers: ProviderStore,
    /// Keys this node announced and keeps re-announcing.
    provided: HashSet<ContentKey>,
    config: Arc<DhtConfig>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            let now = Instant::now();
            match cmd {
                Command::Observe(addr) => self.observe(addr, now),
                Command::Remove(peer) => {
                    if self.routing.remove(&peer) {
                        trace!(peer = %peer.short(), "removed peer from routing table");
                    }
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.routing.closest(&target, count));
                }
                Command::AddLocalProvider {
                    key,
                    provider,
                    remember,
                } => {
                    self.providers
                        .add(key, provider, self.config.provider_ttl, now);
                    if remember {
                        self.provided.insert(key);
                    }
                }
                Command::LocalProviders(key, reply) => {
                    let _ = reply.send(self.providers.get(&key, now));
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.observe(from, now);
                    let _ = reply.send(self.closest_excluding(&target, &from.peer));
                }
                Command::HandleGetProviders(from, key, reply) => {
                    self.observe(from, now);
                    let providers = self.providers.get(&key, now);
                    let closer = self.closest_excluding(key.as_bytes(), &from.peer);
                    let _ = reply.send((providers, closer));
                }
                Command::HandleAddProvider(from, key) => {
                    self.observe(from, now);
                    trace!(
                        from = %from.peer.short(),
                        key = %short(key.as_bytes()),
                        "storing provider record"
                    );
                    self.providers.add(key, from, self.config.provider_ttl, now);
                }
                Command::StaleBuckets(reply) => {
                    let stale = self
                        .routing
                        .stale_buckets(self.config.bucket_refresh_interval, now);
                    let _ = reply.send(stale);
                }
                Command::MarkBucketRefreshed(idx) => self.routing.mark_refreshed(idx, now),
                Command::ProvidedKeys(reply) => {
                    let _ = reply.send(self.provided.iter().copied().collect());
                }
                Command::SweepExpired(reply) => {
                    let _ = reply.send(self.providers.sweep(now));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(DhtStats {
                        routing_peers: self.routing.len(),
                        provider_keys: self.providers.key_count(),
                        provider_records: self.providers.record_count(),
                        provided_keys: self.provided.len(),
                    });
                }
                Command::Quit => {
                    debug!("dht actor shutting down");
                    break;
                }
            }
        }
    }

    fn observe(&mut self, addr: PeerAddress, now: Instant) {
        match self.routing.update(addr, now) {
            Some(BucketInsert::Inserted) => {
                trace!(peer = %addr.peer.short(), addr = %addr.addr, "added peer to routing table");
            }
            Some(BucketInsert::Evicted(old)) => {
                debug!(
                    peer = %addr.peer.short(),
                    evicted = %old.peer.short(),
                    "bucket full, evicted least recently seen peer"
                );
            }
            Some(BucketInsert::Refreshed) | None => {}
        }
    }

    fn closest_excluding(&self, target: &Key, exclude: &PeerId) -> Vec<PeerAddress> {
        let mut closest = self.routing.closest(target, self.config.k + 1);
        closest.retain(|p| &p.peer != exclude);
        closest.truncate(self.config.k);
        closest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{Mutex, RwLock};

    use crate::identity::Keypair;

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        local: PeerAddress,
        calls: Arc<AtomicUsize>,
        add_provider_calls: Arc<AtomicUsize>,
        attempts: Arc<Mutex<HashMap<PeerId, usize>>>,
        failures: Arc<Mutex<HashSet<PeerId>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, local: PeerAddress) -> Self {
            Self {
                registry,
                local,
                calls: Arc::new(AtomicUsize::new(0)),
                add_provider_calls: Arc::new(AtomicUsize::new(0)),
                attempts: Arc::new(Mutex::new(HashMap::new())),
                failures: Arc::new(Mutex::new(HashSet::new())),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn attempts_to(&self, peer: &PeerId) -> usize {
            self.attempts.lock().await.get(peer).copied().unwrap_or(0)
        }

        async fn set_failure(&self, peer: PeerId) {
            self.failures.lock().await.insert(peer);
        }

        async fn reach(&self, to: &PeerAddress) -> anyhow::Result<DhtNode<TestNetwork>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.attempts.lock().await.entry(to.peer).or_default() += 1;
            if self.failures.lock().await.contains(&to.peer) {
                return Err(anyhow!("injected network failure"));
            }
            self.registry
                .get(&to.peer)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<PeerId, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.local().peer, node.clone());
        }

        async fn get(&self, peer: &PeerId) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(peer).cloned()
        }
    }

    #[async_trait]
    impl DhtRpc for TestNetwork {
        async fn find_node(&self, to: &PeerAddress, target: Key) -> anyhow::Result<Vec<PeerAddress>> {
            let peer = self.reach(to).await?;
            Ok(peer.handle_find_node(self.local, target).await)
        }

        async fn get_providers(
            &self,
            to: &PeerAddress,
            key: ContentKey,
        ) -> anyhow::Result<(Vec<PeerAddress>, Vec<PeerAddress>)> {
            let peer = self.reach(to).await?;
            Ok(peer.handle_get_providers(self.local, key).await)
        }

        async fn add_provider(&self, to: &PeerAddress, key: ContentKey) -> anyhow::Result<()> {
            let peer = self.reach(to).await?;
            self.add_provider_calls.fetch_add(1, Ordering::SeqCst);
            peer.handle_add_provider(self.local, key).await;
            Ok(())
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
    }

    impl TestNode {
        async fn new(registry: &Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
            let local = make_peer(index);
            let network = TestNetwork::new(registry.clone(), local);
            let node = DhtNode::new(local, network.clone(), config);
            registry.register(&node).await;
            Self { node, network }
        }

        fn addr(&self) -> PeerAddress {
            self.node.local()
        }
    }

    async fn link(a: &TestNode, b: &TestNode) {
        a.node.observe(b.addr()).await;
        b.node.observe(a.addr()).await;
    }

    fn make_peer(index: u32) -> PeerAddress {
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&index.to_be_bytes());
        let peer = Keypair::from_secret_key_bytes(&seed).peer_id();
        let hi = (index >> 8) as u8;
        let lo = index as u8;
        PeerAddress::new(SocketAddr::from(([10, hi, lo, 1], 9001)), peer)
    }

    /// Peer in bucket 0 relative to an all-zero local id.
    fn far_peer(tag: u8) -> PeerAddress {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        bytes[1] = tag;
        PeerAddress::new(
            SocketAddr::from(([10, 0, 0, tag], 9001)),
            PeerId::from_bytes(bytes),
        )
    }

    fn fast_config() -> DhtConfig {
        DhtConfig {
            lookup_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        }
    }

    #[test]
    fn bucket_index_finds_first_different_bit() {
        let zero = PeerId::from_bytes([0u8; 32]);
        let mut other = [0u8; 32];
        other[0] = 0x80;
        assert_eq!(bucket_index(&zero, &other), 0);
        other[0] = 0x01;
        assert_eq!(bucket_index(&zero, &other), 7);
        other[0] = 0;
        other[31] = 0x01;
        assert_eq!(bucket_index(&zero, &other), 255);
    }

    #[test]
    fn random_id_for_bucket_lands_in_correct_bucket() {
        let self_id = make_peer(1).peer;
        for idx in [0usize, 1, 7, 8, 100, 254, 255] {
            let target = random_id_for_bucket(&self_id, idx);
            assert_eq!(bucket_index(&self_id, &target), idx, "bucket {idx}");
        }
    }

    #[test]
    fn bucket_bounded_with_least_recently_seen_eviction() {
        let base = Instant::now();
        let mut table = RoutingTable::new(PeerId::from_bytes([0u8; 32]), 3);

        for tag in 1..=3u8 {
            let outcome = table.update(far_peer(tag), base + Duration::from_secs(tag as u64));
            assert_eq!(outcome, Some(BucketInsert::Inserted));
        }

        let outcome = table.update(far_peer(4), base + Duration::from_secs(4));
        assert_eq!(outcome, Some(BucketInsert::Evicted(far_peer(1))));
        assert_eq!(table.len(), 3);
        assert!(table.get(&far_peer(1).peer).is_none());

        // Seeing peer 2 again makes peer 3 the least recently seen.
        assert_eq!(
            table.update(far_peer(2), base + Duration::from_secs(5)),
            Some(BucketInsert::Refreshed)
        );
        let outcome = table.update(far_peer(5), base + Duration::from_secs(6));
        assert_eq!(outcome, Some(BucketInsert::Evicted(far_peer(3))));

        for tag in 6..40u8 {
            table.update(far_peer(tag), base + Duration::from_secs(tag as u64));
            assert!(table.buckets[0].entries.len() <= 3);
        }
    }

    #[test]
    fn local_peer_never_enters_routing_table() {
        let local = make_peer(9);
        let mut table = RoutingTable::new(local.peer, DEFAULT_K);
        assert_eq!(table.update(local, Instant::now()), None);
        assert!(table.is_empty());
    }

    #[test]
    fn closest_orders_by_distance() {
        let mut table = RoutingTable::new(make_peer(0).peer, DEFAULT_K);
        let now = Instant::now();
        for i in 1..50 {
            table.update(make_peer(i), now);
        }
        let target = *make_peer(1000).peer.as_bytes();
        let closest = table.closest(&target, 10);
        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            let a = pair[0].peer.xor_distance(&target);
            let b = pair[1].peer.xor_distance(&target);
            assert!(distance_cmp(&a, &b).is_lt());
        }
    }

    #[test]
    fn equidistant_entries_rank_most_recent_first() {
        let base = Instant::now();
        let peer = make_peer(3);
        let target = *make_peer(4).peer.as_bytes();
        let older = RoutingEntry {
            addr: PeerAddress::new("10.0.0.1:1".parse().unwrap(), peer.peer),
            last_seen: base,
        };
        let newer = RoutingEntry {
            addr: PeerAddress::new("10.0.0.2:2".parse().unwrap(), peer.peer),
            last_seen: base + Duration::from_secs(1),
        };
        let mut entries = vec![older.clone(), newer.clone()];
        rank_entries(&mut entries, &target);
        assert_eq!(entries[0].addr, newer.addr);
        assert_eq!(entries[1].addr, older.addr);
    }

    #[test]
    fn provider_record_expires_at_ttl() {
        let ttl = Duration::from_secs(10);
        let t0 = Instant::now();
        let key = ContentKey::from_data(b"content");
        let mut store = ProviderStore::new(MAX_PROVIDER_KEYS, 20);
        store.add(key, make_peer(1), ttl, t0);

        let epsilon = Duration::from_millis(1);
        assert_eq!(store.get(&key, t0 + ttl - epsilon), vec![make_peer(1)]);
        assert!(store.get(&key, t0 + ttl).is_empty());
        assert!(store.get(&key, t0 + ttl + epsilon).is_empty());

        assert_eq!(store.sweep(t0 + ttl + epsilon), 1);
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn provider_refresh_extends_expiry() {
        let ttl = Duration::from_secs(10);
        let t0 = Instant::now();
        let key = ContentKey::from_data(b"content");
        let mut store = ProviderStore::new(MAX_PROVIDER_KEYS, 20);
        store.add(key, make_peer(1), ttl, t0);
        store.add(key, make_peer(1), ttl, t0 + Duration::from_secs(5));

        assert_eq!(store.record_count(), 1);
        assert_eq!(store.get(&key, t0 + Duration::from_secs(12)).len(), 1);
    }

    #[test]
    fn full_provider_list_replaces_soonest_expiry() {
        let t0 = Instant::now();
        let key = ContentKey::from_data(b"popular");
        let mut store = ProviderStore::new(MAX_PROVIDER_KEYS, 3);

        store.add(key, make_peer(1), Duration::from_secs(50), t0);
        store.add(key, make_peer(2), Duration::from_secs(10), t0);
        store.add(key, make_peer(3), Duration::from_secs(30), t0);
        store.add(key, make_peer(4), Duration::from_secs(40), t0);

        let providers = store.get(&key, t0);
        assert_eq!(providers.len(), 3);
        assert!(!providers.contains(&make_peer(2)));
        assert!(providers.contains(&make_peer(4)));
    }

    #[test]
    fn provider_keys_bounded_by_lru() {
        let t0 = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut store = ProviderStore::new(2, 20);
        let keys: Vec<ContentKey> = (0..3u8).map(|i| ContentKey::from_data(&[i])).collect();
        for key in &keys {
            store.add(*key, make_peer(1), ttl, t0);
        }
        assert_eq!(store.key_count(), 2);
        assert!(store.get(&keys[0], t0).is_empty());
        assert_eq!(store.get(&keys[2], t0).len(), 1);
    }

    #[test]
    fn config_validation() {
        assert!(DhtConfig::default().validate().is_ok());
        let bad = [
            DhtConfig { k: 0, ..DhtConfig::default() },
            DhtConfig { alpha: 0, ..DhtConfig::default() },
            DhtConfig { k: 2, alpha: 3, ..DhtConfig::default() },
            DhtConfig { max_providers_per_key: 0, ..DhtConfig::default() },
            DhtConfig { query_timeout: Duration::ZERO, ..DhtConfig::default() },
            DhtConfig {
                reprovide_interval: Duration::from_secs(10),
                provider_ttl: Duration::from_secs(10),
                ..DhtConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "accepted {config:?}");
        }
    }

    #[tokio::test]
    async fn iterative_find_node_discovers_peers_through_hub() {
        let registry = Arc::new(NetworkRegistry::default());
        let hub = TestNode::new(&registry, 0x10, fast_config()).await;
        let mut spokes = Vec::new();
        for i in 0..8 {
            let spoke = TestNode::new(&registry, 0x20 + i, fast_config()).await;
            link(&spoke, &hub).await;
            spokes.push(spoke);
        }

        let target = *spokes[7].addr().peer.as_bytes();
        let found = spokes[0].node.find_node(target).await.unwrap();
        assert_eq!(found.first().map(|p| p.peer), Some(spokes[7].addr().peer));
        assert!(spokes[0].node.stats().await.unwrap().routing_peers > 1);
    }

    #[tokio::test]
    async fn provide_and_find_converge_across_three_nodes() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, fast_config()).await;
        let b = TestNode::new(&registry, 2, fast_config()).await;
        let c = TestNode::new(&registry, 3, fast_config()).await;
        link(&a, &b).await;
        link(&c, &b).await;

        let key = ContentKey::from_data(b"shared file");
        a.node.provide(key, true).await.unwrap();

        let providers = c.node.find_providers(key, 5).await.unwrap();
        assert_eq!(providers, vec![a.addr()]);
        assert!(a.network.add_provider_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(a.node.stats().await.unwrap().provided_keys, 1);
    }

    #[tokio::test]
    async fn find_providers_dedups_and_respects_limit() {
        let registry = Arc::new(NetworkRegistry::default());
        let hub = TestNode::new(&registry, 100, fast_config()).await;
        let key = ContentKey::from_data(b"many providers");
        let mut providers = Vec::new();
        for i in 0..4 {
            let p = TestNode::new(&registry, 200 + i, fast_config()).await;
            link(&p, &hub).await;
            p.node.provide(key, true).await.unwrap();
            providers.push(p);
        }

        let seeker = TestNode::new(&registry, 300, fast_config()).await;
        link(&seeker, &hub).await;

        let found = seeker.node.find_providers(key, 2).await.unwrap();
        assert_eq!(found.len(), 2);

        let all = seeker.node.find_providers(key, 10).await.unwrap();
        assert_eq!(all.len(), 4);
        let unique: HashSet<PeerId> = all.iter().map(|p| p.peer).collect();
        assert_eq!(unique.len(), 4);
    }

    #[tokio::test]
    async fn unknown_key_yields_empty_result() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, fast_config()).await;
        let b = TestNode::new(&registry, 2, fast_config()).await;
        link(&a, &b).await;

        let found = a
            .node
            .find_providers(ContentKey::from_data(b"nobody has this"), 3)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn lonely_provide_times_out_but_keeps_local_record() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, fast_config()).await;
        let key = ContentKey::from_data(b"alone");

        let err = a.node.provide(key, true).await.unwrap_err();
        assert!(matches!(err, Error::LookupTimeout));
        assert_eq!(a.node.find_providers(key, 1).await.unwrap(), vec![a.addr()]);
    }

    #[tokio::test]
    async fn unresponsive_peer_is_retried_then_dropped() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, fast_config()).await;
        let b = TestNode::new(&registry, 2, fast_config()).await;
        link(&a, &b).await;
        a.network.set_failure(b.addr().peer).await;

        let err = a
            .node
            .provide(ContentKey::from_data(b"x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LookupTimeout));

        let retries = DhtConfig::default().query_retries as usize;
        assert_eq!(a.network.attempts_to(&b.addr().peer).await, 1 + retries);
        assert_eq!(a.node.stats().await.unwrap().routing_peers, 0);
    }

    #[tokio::test]
    async fn cancelled_find_providers_makes_no_network_calls() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, fast_config()).await;
        let b = TestNode::new(&registry, 2, fast_config()).await;
        link(&a, &b).await;

        let token = CancellationToken::new();
        token.cancel();
        let deadline = Deadline::none().with_token(token);
        let result = a
            .node
            .find_providers_with(ContentKey::from_data(b"k"), 5, &deadline)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let expired = Deadline::after(Duration::ZERO);
        let result = a
            .node
            .provide_with(ContentKey::from_data(b"k"), true, &expired)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));

        assert_eq!(a.network.calls(), 0);
        assert_eq!(a.node.stats().await.unwrap().provider_records, 0);
    }

    /// Every RPC blocks forever; `in_flight` counts the ones not yet dropped.
    #[derive(Clone, Default)]
    struct HangingNetwork {
        started: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
    }

    struct InFlight(Arc<AtomicUsize>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl HangingNetwork {
        async fn hang<T>(&self) -> anyhow::Result<T> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let _guard = InFlight(self.in_flight.clone());
            std::future::pending().await
        }

        async fn wait_started(&self) {
            while self.started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn wait_drained(&self) {
            tokio::time::timeout(Duration::from_secs(1), async {
                while self.in_flight.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("in-flight queries were not dropped");
        }
    }

    #[async_trait]
    impl DhtRpc for HangingNetwork {
        async fn find_node(&self, _: &PeerAddress, _: Key) -> anyhow::Result<Vec<PeerAddress>> {
            self.hang().await
        }
        async fn get_providers(
            &self,
            _: &PeerAddress,
            _: ContentKey,
        ) -> anyhow::Result<(Vec<PeerAddress>, Vec<PeerAddress>)> {
            self.hang().await
        }
        async fn add_provider(&self, _: &PeerAddress, _: ContentKey) -> anyhow::Result<()> {
            self.hang().await
        }
    }

    fn slow_config() -> DhtConfig {
        DhtConfig {
            lookup_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            ..DhtConfig::default()
        }
    }

    #[tokio::test]
    async fn cancelling_mid_lookup_returns_promptly_and_drops_queries() {
        let network = HangingNetwork::default();
        let node = DhtNode::new(make_peer(1), network.clone(), slow_config());
        for i in 2..6 {
            node.observe(make_peer(i)).await;
        }

        let token = CancellationToken::new();
        let deadline = Deadline::none().with_token(token.clone());
        let canceller = {
            let network = network.clone();
            tokio::spawn(async move {
                network.wait_started().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            node.find_providers_with(ContentKey::from_data(b"k"), 5, &deadline),
        )
        .await
        .expect("lookup ignored cancellation");
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        canceller.await.unwrap();
        network.wait_drained().await;

        node.quit().await;
    }

    #[tokio::test]
    async fn deadline_expiring_mid_announce_cancels_provide() {
        let network = HangingNetwork::default();
        let node = DhtNode::new(make_peer(1), network.clone(), slow_config());
        for i in 2..6 {
            node.observe(make_peer(i)).await;
        }

        let key = ContentKey::from_data(b"announce");
        let started = Instant::now();
        let result = node
            .provide_with(key, true, &Deadline::after(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(network.started.load(Ordering::SeqCst) > 0);
        network.wait_drained().await;

        // The local record survives the cancelled announcement.
        let stats = node.stats().await.unwrap();
        assert_eq!(stats.provider_records, 1);

        node.quit().await;
    }

    #[tokio::test]
    async fn bootstrap_learns_peers_through_seed() {
        let registry = Arc::new(NetworkRegistry::default());
        let seed = TestNode::new(&registry, 1, fast_config()).await;
        let others: Vec<TestNode> = {
            let mut v = Vec::new();
            for i in 2..6 {
                let node = TestNode::new(&registry, i, fast_config()).await;
                link(&node, &seed).await;
                v.push(node);
            }
            v
        };

        let joiner = TestNode::new(&registry, 50, fast_config()).await;
        let known = joiner.node.bootstrap(seed.addr()).await.unwrap();
        assert_eq!(known, 1 + others.len());
    }

    #[tokio::test]
    async fn bootstrap_through_dead_seed_fails() {
        let registry = Arc::new(NetworkRegistry::default());
        let joiner = TestNode::new(&registry, 50, fast_config()).await;
        let err = joiner.node.bootstrap(make_peer(51)).await.unwrap_err();
        assert!(matches!(err, Error::LookupTimeout));
    }

    #[tokio::test]
    async fn oversized_responses_are_truncated() {
        struct ChattyNetwork;

        #[async_trait]
        impl DhtRpc for ChattyNetwork {
            async fn find_node(&self, _: &PeerAddress, _: Key) -> anyhow::Result<Vec<PeerAddress>> {
                Ok((0..150).map(make_peer).collect())
            }
            async fn get_providers(
                &self,
                _: &PeerAddress,
                _: ContentKey,
            ) -> anyhow::Result<(Vec<PeerAddress>, Vec<PeerAddress>)> {
                Ok(((0..150).map(make_peer).collect(), Vec::new()))
            }
            async fn add_provider(&self, _: &PeerAddress, _: ContentKey) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let timeout = Duration::from_secs(1);
        let reply = query_peer(&ChattyNetwork, &make_peer(1), [0u8; 32], LookupMode::FindNode, timeout, 0)
            .await
            .unwrap();
        assert_eq!(reply.closer.len(), MAX_PEERS_PER_RESPONSE);

        let mode = LookupMode::GetProviders(ContentKey::from_data(b"k"));
        let reply = query_peer(&ChattyNetwork, &make_peer(1), [0u8; 32], mode, timeout, 0)
            .await
            .unwrap();
        assert_eq!(reply.providers.len(), MAX_PEERS_PER_RESPONSE);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_sweeps_expired_records() {
        let config = DhtConfig {
            provider_ttl: Duration::from_secs(2),
            reprovide_interval: Duration::from_secs(1),
            ..fast_config()
        };
        let registry = Arc::new(NetworkRegistry::default());
        let b = TestNode::new(&registry, 2, config).await;

        b.node
            .handle_add_provider(make_peer(1), ContentKey::from_data(b"k"))
            .await;
        assert_eq!(b.node.stats().await.unwrap().provider_records, 1);

        tokio::time::sleep(EXPIRY_SWEEP_INTERVAL + Duration::from_secs(1)).await;
        let stats = b.node.stats().await.unwrap();
        assert_eq!(stats.provider_records, 0);
        assert_eq!(stats.provider_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn provided_keys_are_reannounced() {
        let config = DhtConfig {
            provider_ttl: Duration::from_secs(10),
            reprovide_interval: Duration::from_secs(1),
            ..fast_config()
        };
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, config.clone()).await;
        let b = TestNode::new(&registry, 2, config).await;
        link(&a, &b).await;

        let key = ContentKey::from_data(b"keep me alive");
        a.node.provide(key, true).await.unwrap();
        let after_provide = a.network.add_provider_calls.load(Ordering::SeqCst);
        assert_eq!(after_provide, 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(a.network.add_provider_calls.load(Ordering::SeqCst) > after_provide);

        // Past the original TTL, b still holds a live record thanks to re-announcement.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(b.node.find_providers(key, 1).await.unwrap(), vec![a.addr()]);
    }

    #[tokio::test]
    async fn quit_stops_actor() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1, fast_config()).await;
        a.node.quit().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(a.node.stats().await, Err(Error::Shutdown)));
    }
}
