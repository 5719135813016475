//! # swarmlink - Peer-to-Peer Content Routing and Broadcast
//!
//! swarmlink runs a small peer-to-peer stack over mutually authenticated QUIC:
//!
//! - **Identity**: Ed25519 keypairs; a PeerId is the blake3 hash of the public key
//! - **Content routing**: Kademlia-style DHT mapping content keys to provider peers
//! - **Broadcast**: flood-fill pubsub delivering each message once per subscriber
//! - **Transport**: one QUIC endpoint per node with certificate-bound identities
//!
//! ## Architecture
//!
//! Stateful components follow the actor pattern:
//! - Each component (RPC registry, DHT, FloodSub) has a public handle and a private actor
//! - Handles are cheap to clone and talk to the actor over async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! The DHT and FloodSub reach the network only through the traits in
//! `protocols`, which the QUIC layer implements.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, PeerIds, content keys, peer addresses |
//! | `crypto` | TLS certificates, verifiers and signatures |
//! | `transport` | QUIC endpoint, listener and dialing |
//! | `rpc` | Connection registry and request framing |
//! | `dht` | Routing table, provider records, iterative lookups |
//! | `floodsub` | Flood-fill broadcast |
//! | `protocols` | Network traits used by `dht` and `floodsub` |
//! | `messages` | Wire types |
//! | `config` | Node configuration |
//! | `cancel` | Deadlines and cancellation |

mod cancel;
mod config;
mod crypto;
mod dht;
mod error;
mod floodsub;
mod identity;
mod messages;
mod node;
mod protocols;
mod rpc;
mod transport;

pub use cancel::Deadline;
pub use config::NodeConfig;
pub use dht::{DhtConfig, DhtStats};
pub use error::{Error, Result};
pub use floodsub::{FloodSubConfig, Subscription};
pub use identity::{ContentKey, Keypair, PeerAddress, PeerId};
pub use messages::{Message, MessageId};
pub use node::Node;
pub use transport::{Connection, ConnectionEvent, Direction};
