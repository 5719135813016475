//! Content routing across real QUIC nodes.

use std::time::Duration;

use swarmlink::{ContentKey, Node, PeerId};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

async fn local_node() -> Node {
    Node::bind("127.0.0.1:0").await.expect("bind failed")
}

/// A bootstrap node plus `count` peers that joined through it, in join order.
async fn swarm(count: usize) -> (Node, Vec<Node>) {
    let seed = local_node().await;
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        let node = local_node().await;
        let known = timeout(TEST_TIMEOUT, node.bootstrap(&seed.peer_address()))
            .await
            .expect("bootstrap timed out")
            .expect("bootstrap failed");
        assert!(known >= 1);
        peers.push(node);
    }
    (seed, peers)
}

async fn shutdown_all(seed: Node, peers: Vec<Node>) {
    for peer in peers {
        peer.shutdown().await;
    }
    seed.shutdown().await;
}

fn ids(addrs: &[swarmlink::PeerAddress]) -> Vec<PeerId> {
    addrs.iter().map(|a| a.peer).collect()
}

#[tokio::test]
async fn bootstrap_fills_routing_tables() {
    let (seed, peers) = swarm(2).await;

    // The second joiner learned about the first through the seed.
    let stats = peers[1].dht_stats().await.unwrap();
    assert!(stats.routing_peers >= 2, "{stats:?}");

    let seed_stats = seed.dht_stats().await.unwrap();
    assert!(seed_stats.routing_peers >= 2, "{seed_stats:?}");

    shutdown_all(seed, peers).await;
}

#[tokio::test]
async fn provider_is_found_from_another_node() {
    let (seed, peers) = swarm(2).await;
    let key = ContentKey::from_data(b"shared document");

    timeout(TEST_TIMEOUT, peers[0].provide(key, true))
        .await
        .expect("provide timed out")
        .expect("provide failed");

    let stats = peers[0].dht_stats().await.unwrap();
    assert_eq!(stats.provided_keys, 1);

    let found = timeout(TEST_TIMEOUT, peers[1].find_providers(key, 5))
        .await
        .expect("find_providers timed out")
        .unwrap();
    assert_eq!(ids(&found), vec![peers[0].peer_id()]);
    assert_eq!(found[0].addr, peers[0].local_addr());

    let from_seed = seed.find_providers(key, 5).await.unwrap();
    assert_eq!(ids(&from_seed), vec![peers[0].peer_id()]);

    shutdown_all(seed, peers).await;
}

#[tokio::test]
async fn several_providers_are_deduplicated_and_limited() {
    let (seed, peers) = swarm(3).await;
    let key = ContentKey::from_data(b"popular");

    peers[0].provide(key, true).await.unwrap();
    peers[1].provide(key, true).await.unwrap();

    let found = timeout(TEST_TIMEOUT, peers[2].find_providers(key, 10))
        .await
        .unwrap()
        .unwrap();
    let mut found_ids = ids(&found);
    found_ids.sort();
    let mut expected = vec![peers[0].peer_id(), peers[1].peer_id()];
    expected.sort();
    assert_eq!(found_ids, expected);

    let limited = peers[2].find_providers(key, 1).await.unwrap();
    assert_eq!(limited.len(), 1);

    shutdown_all(seed, peers).await;
}

#[tokio::test]
async fn unknown_key_yields_empty_result() {
    let (seed, peers) = swarm(2).await;
    let found = timeout(
        TEST_TIMEOUT,
        peers[0].find_providers(ContentKey::from_data(b"missing"), 3),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(found.is_empty());
    shutdown_all(seed, peers).await;
}

#[tokio::test]
async fn rendezvous_connects_peers_sharing_a_topic() {
    let (seed, peers) = swarm(2).await;

    let first = timeout(TEST_TIMEOUT, peers[0].rendezvous("swarmlink-chat", 10))
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_empty(), "nobody else has joined yet");

    let second = timeout(TEST_TIMEOUT, peers[1].rendezvous("swarmlink-chat", 10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ids(&second), vec![peers[0].peer_id()]);
    assert!(peers[1].connected_peers().await.contains(&peers[0].peer_id()));

    // A different topic does not mix with the first.
    let other = peers[1].rendezvous("other-room", 10).await.unwrap();
    assert!(other.is_empty());

    shutdown_all(seed, peers).await;
}
