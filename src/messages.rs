//! # Wire Protocol Messages
//!
//! Every request travels on its own bidirectional QUIC stream as a 4-byte
//! big-endian length prefix followed by a bincode body.
//!
//! | Protocol | Request Type | Response Type |
//! |----------|--------------|---------------|
//! | DHT | `DhtRequest` | `DhtResponse` |
//! | FloodSub | `Message` | `FloodSubAck` |
//!
//! ## Limits
//!
//! - Requests are capped at [`MAX_REQUEST_SIZE`], responses at
//!   [`MAX_RESPONSE_SIZE`].
//! - All decoding goes through [`deserialize_bounded`] so a hostile length
//!   field cannot make bincode allocate past the frame.
//!
//! ## Message IDs
//!
//! Flooded messages carry a 32-byte [`MessageId`]:
//! `blake3(sender || seqno_le || topic_len_le(u32) || topic || payload)`.
//! The publisher signs `"swarmlink-floodsub-v1:" || id`.

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{sign_with_domain, verify_with_domain, FLOODSUB_SIGNATURE_DOMAIN};
use crate::dht::Key;
use crate::identity::{ContentKey, Keypair, PeerAddress, PeerId};

/// Largest flooded payload.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest request frame accepted from a peer: a full-size flooded payload
/// plus room for its topic, signature and envelope.
pub const MAX_REQUEST_SIZE: usize = MAX_MESSAGE_SIZE + 4 * 1024;

/// Largest response frame accepted from a peer.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Longest topic name, in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_RESPONSE_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with the frame size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// DHT
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    FindNode {
        from: PeerAddress,
        target: Key,
    },
    GetProviders {
        from: PeerAddress,
        key: ContentKey,
    },
    AddProvider {
        from: PeerAddress,
        key: ContentKey,
    },
}

impl DhtRequest {
    pub fn from(&self) -> &PeerAddress {
        match self {
            DhtRequest::FindNode { from, .. }
            | DhtRequest::GetProviders { from, .. }
            | DhtRequest::AddProvider { from, .. } => from,
        }
    }

    pub(crate) fn from_mut(&mut self) -> &mut PeerAddress {
        match self {
            DhtRequest::FindNode { from, .. }
            | DhtRequest::GetProviders { from, .. }
            | DhtRequest::AddProvider { from, .. } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Ack,
    Nodes(Vec<PeerAddress>),
    Providers {
        providers: Vec<PeerAddress>,
        closer: Vec<PeerAddress>,
    },
    Error {
        message: String,
    },
}

// ============================================================================
// FloodSub
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub fn compute(sender: &PeerId, seqno: u64, topic: &str, payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(sender.as_bytes());
        hasher.update(&seqno.to_le_bytes());
        hasher.update(&(topic.len() as u32).to_le_bytes());
        hasher.update(topic.as_bytes());
        hasher.update(payload);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Why an inbound [`Message`] was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message id does not match its contents")]
    IdMismatch,
    #[error("public key does not belong to sender")]
    SenderMismatch,
    #[error("bad signature")]
    BadSignature,
    #[error("invalid topic")]
    InvalidTopic,
    #[error("payload too large")]
    TooLarge,
}

/// A signed flood-fill message. Immutable once built.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub sender: PeerId,
    pub seqno: u64,
    pub payload: Vec<u8>,
    pub id: MessageId,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl Message {
    pub fn new_signed(keypair: &Keypair, topic: &str, seqno: u64, payload: Vec<u8>) -> Self {
        let sender = keypair.peer_id();
        let id = MessageId::compute(&sender, seqno, topic, &payload);
        let signature = sign_with_domain(keypair, FLOODSUB_SIGNATURE_DOMAIN, id.as_bytes());
        Self {
            topic: topic.to_string(),
            sender,
            seqno,
            payload,
            id,
            public_key: keypair.public_key_bytes(),
            signature,
        }
    }

    /// Check id, sender binding, signature and size bounds.
    pub fn verify(&self, max_payload: usize) -> Result<(), MessageError> {
        if !is_valid_topic(&self.topic) {
            return Err(MessageError::InvalidTopic);
        }
        if self.payload.len() > max_payload {
            return Err(MessageError::TooLarge);
        }
        if MessageId::compute(&self.sender, self.seqno, &self.topic, &self.payload) != self.id {
            return Err(MessageError::IdMismatch);
        }
        if PeerId::from_public_key(&self.public_key) != self.sender {
            return Err(MessageError::SenderMismatch);
        }
        verify_with_domain(
            &self.public_key,
            FLOODSUB_SIGNATURE_DOMAIN,
            self.id.as_bytes(),
            &self.signature,
        )
        .map_err(|_| MessageError::BadSignature)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("sender", &self.sender)
            .field("seqno", &self.seqno)
            .field("len", &self.payload.len())
            .field("id", &self.id)
            .finish()
    }
}

/// Non-empty, at most [`MAX_TOPIC_LEN`] bytes, ASCII alphanumerics and `/-_.:`.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'-' | b'_' | b'.' | b':'))
}

// ============================================================================
// RPC Envelope
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Dht(DhtRequest),
    FloodSub(Message),
}

impl RpcRequest {
    /// PeerId the request claims to come from. FloodSub messages are
    /// relayed, so their sender is not the connection's peer.
    pub fn claimed_peer(&self) -> Option<PeerId> {
        match self {
            RpcRequest::Dht(request) => Some(request.from().peer),
            RpcRequest::FloodSub(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Dht(DhtResponse),
    FloodSubAck,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address(seed: u8) -> PeerAddress {
        PeerAddress::new(
            "127.0.0.1:4433".parse().unwrap(),
            PeerId::from_bytes([seed; 32]),
        )
    }

    #[test]
    fn message_id_depends_on_every_field() {
        let sender = PeerId::from_bytes([1u8; 32]);
        let base = MessageId::compute(&sender, 1, "chat", b"hi");
        assert_eq!(base, MessageId::compute(&sender, 1, "chat", b"hi"));
        assert_ne!(base, MessageId::compute(&PeerId::from_bytes([2u8; 32]), 1, "chat", b"hi"));
        assert_ne!(base, MessageId::compute(&sender, 2, "chat", b"hi"));
        assert_ne!(base, MessageId::compute(&sender, 1, "chat2", b"hi"));
        assert_ne!(base, MessageId::compute(&sender, 1, "chat", b"ho"));
        // Length prefix keeps topic/payload boundaries distinct.
        assert_ne!(
            MessageId::compute(&sender, 1, "ab", b"c"),
            MessageId::compute(&sender, 1, "a", b"bc")
        );
    }

    #[test]
    fn signed_message_verifies() {
        let keypair = Keypair::generate().unwrap();
        let msg = Message::new_signed(&keypair, "chat", 7, b"hello".to_vec());
        assert_eq!(msg.sender, keypair.peer_id());
        assert!(msg.verify(1024).is_ok());
    }

    #[test]
    fn tampered_messages_rejected() {
        let keypair = Keypair::generate().unwrap();
        let msg = Message::new_signed(&keypair, "chat", 7, b"hello".to_vec());

        let mut payload = msg.clone();
        payload.payload = b"HELLO".to_vec();
        assert_eq!(payload.verify(1024), Err(MessageError::IdMismatch));

        // Re-computing the id after tampering still fails the signature.
        payload.id = MessageId::compute(&payload.sender, payload.seqno, &payload.topic, &payload.payload);
        assert_eq!(payload.verify(1024), Err(MessageError::BadSignature));

        let other = Keypair::generate().unwrap();
        let mut key = msg.clone();
        key.public_key = other.public_key_bytes();
        assert_eq!(key.verify(1024), Err(MessageError::SenderMismatch));

        assert_eq!(msg.verify(2), Err(MessageError::TooLarge));

        let mut topic = msg;
        topic.topic = String::new();
        assert_eq!(topic.verify(1024), Err(MessageError::InvalidTopic));
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("swarmlink-chat"));
        assert!(is_valid_topic("a/b.c:d_e"));
        assert!(is_valid_topic(&"x".repeat(MAX_TOPIC_LEN)));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LEN + 1)));
        assert!(!is_valid_topic("has space"));
        assert!(!is_valid_topic("ünïcode"));
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_bounded::<RpcRequest>(&garbage).is_err());

        let request = RpcRequest::Dht(DhtRequest::FindNode {
            from: test_address(1),
            target: [7u8; 32],
        });
        let bytes = serialize(&request).unwrap();
        assert!(deserialize_bounded::<RpcRequest>(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn oversized_length_field_rejected() {
        // A Nodes response claiming u64::MAX entries must not allocate.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(deserialize_bounded::<RpcResponse>(&bytes).is_err());
    }

    #[test]
    fn claimed_peer_extraction() {
        let from = test_address(42);
        let find = RpcRequest::Dht(DhtRequest::FindNode { from, target: [0u8; 32] });
        assert_eq!(find.claimed_peer(), Some(from.peer));

        let keypair = Keypair::generate().unwrap();
        let flood = RpcRequest::FloodSub(Message::new_signed(&keypair, "t", 1, vec![]));
        assert_eq!(flood.claimed_peer(), None);
    }

    #[test]
    fn provider_response_survives_wire() {
        let response = RpcResponse::Dht(DhtResponse::Providers {
            providers: vec![test_address(1)],
            closer: vec![test_address(2), test_address(3)],
        });
        let bytes = serialize(&response).unwrap();
        match deserialize_bounded::<RpcResponse>(&bytes).unwrap() {
            RpcResponse::Dht(DhtResponse::Providers { providers, closer }) => {
                assert_eq!(providers, vec![test_address(1)]);
                assert_eq!(closer.len(), 2);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn signed_message_survives_wire() {
        let keypair = Keypair::generate().unwrap();
        let msg = Message::new_signed(&keypair, "chat", 3, b"payload".to_vec());
        let bytes = serialize(&RpcRequest::FloodSub(msg.clone())).unwrap();
        match deserialize_bounded::<RpcRequest>(&bytes).unwrap() {
            RpcRequest::FloodSub(decoded) => {
                assert_eq!(decoded, msg);
                assert!(decoded.verify(1024).is_ok());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
