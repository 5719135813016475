//! # Identity and Addressing
//!
//! - [`Keypair`]: Ed25519 signing key owned by the node process
//! - [`PeerId`]: `blake3(public key)`, the stable 32-byte peer identifier
//! - [`ContentKey`]: opaque 32-byte lookup key for the content routing table
//! - [`PeerAddress`]: socket address plus the PeerId it claims to belong to
//!
//! PeerIds and ContentKeys share one 256-bit keyspace so XOR distance can be
//! taken between any two of them.
//!
//! ## Key File Format
//!
//! ```text
//! +--------+---------+----------+------------------+
//! | "SWLK" | version | key type | 32-byte seed     |
//! | 4 B    | 1 B (1) | 1 B (1)  |                  |
//! +--------+---------+----------+------------------+
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KEY_FILE_MAGIC: &[u8; 4] = b"SWLK";
const KEY_FILE_VERSION: u8 = 1;
const KEY_TYPE_ED25519: u8 = 1;
const KEY_FILE_LEN: usize = 4 + 1 + 1 + 32;

/// Domain prefix for topic rendezvous keys.
const TOPIC_KEY_DOMAIN: &[u8] = b"swarmlink-topic:";

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS entropy source.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| Error::KeyGen(e.to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.fill(0);
        Ok(Self { signing_key })
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Decode a key blob produced by [`Keypair::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_FILE_LEN {
            return Err(Error::Decode(format!(
                "key blob is {} bytes, expected {}",
                bytes.len(),
                KEY_FILE_LEN
            )));
        }
        if &bytes[..4] != KEY_FILE_MAGIC {
            return Err(Error::Decode("key blob has wrong magic".into()));
        }
        if bytes[4] != KEY_FILE_VERSION {
            return Err(Error::Decode(format!(
                "unsupported key blob version {}",
                bytes[4]
            )));
        }
        if bytes[5] != KEY_TYPE_ED25519 {
            return Err(Error::Decode(format!("unsupported key type {}", bytes[5])));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[6..]);
        let keypair = Self::from_secret_key_bytes(&seed);
        seed.fill(0);
        Ok(keypair)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_FILE_LEN);
        out.extend_from_slice(KEY_FILE_MAGIC);
        out.push(KEY_FILE_VERSION);
        out.push(KEY_TYPE_ED25519);
        out.extend_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Read a key file written by [`Keypair::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Decode(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(&bytes)
    }

    /// Write the key file, owner-readable only on Unix.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let key_file = |source| Error::KeyFile {
            path: path.to_path_buf(),
            source,
        };
        std::fs::write(path, self.to_bytes()).map_err(key_file)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(key_file)?;
        }
        Ok(())
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PeerId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn xor_distance(&self, target: &[u8; 32]) -> [u8; 32] {
        xor_distance(&self.0, target)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes in hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex32(s).map(Self)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// ContentKey
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Content-addressed key: `blake3(data)`.
    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Rendezvous key for peers interested in `topic`.
    pub fn for_topic(topic: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TOPIC_KEY_DOMAIN);
        hasher.update(topic.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for ContentKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex32(s).map(Self)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

fn decode_hex32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| Error::Decode(format!("invalid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::Decode(format!("expected 32 bytes, got {}", b.len())))
}

// ============================================================================
// XOR Metric
// ============================================================================

pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as 256-bit big-endian integers.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// PeerAddress
// ============================================================================

/// A transport endpoint plus the peer it is claimed to belong to.
///
/// Text form: `/ip4/127.0.0.1/udp/9876/id/<64 hex>`. `ip6` is accepted for
/// IPv6 hosts; `quic` and `tcp` are accepted in place of `udp`, and `p2p` or
/// `ipfs` in place of `id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub addr: SocketAddr,
    pub peer: PeerId,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr, peer: PeerId) -> Self {
        Self { addr, peer }
    }

    /// Replace an unspecified IP (`0.0.0.0`, `::`) with the one observed on
    /// the connection. The advertised port is kept.
    pub fn with_observed_ip(mut self, observed: IpAddr) -> Self {
        if self.addr.ip().is_unspecified() {
            self.addr.set_ip(observed);
        }
        self
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.addr.ip() {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        write!(
            f,
            "/{}/{}/udp/{}/id/{}",
            family,
            self.addr.ip(),
            self.addr.port(),
            self.peer
        )
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({}@{})", self.peer.short(), self.addr)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let [empty, family, host, proto, port, id_tag, id] = parts.as_slice() else {
            return Err(Error::Decode(format!(
                "address must look like /ip4/<host>/udp/<port>/id/<peer>: {s}"
            )));
        };
        if !empty.is_empty() {
            return Err(Error::Decode(format!("address must start with '/': {s}")));
        }

        let ip: IpAddr = match *family {
            "ip4" => host
                .parse::<std::net::Ipv4Addr>()
                .map(IpAddr::V4)
                .map_err(|e| Error::Decode(format!("invalid ip4 host {host}: {e}")))?,
            "ip6" => host
                .parse::<std::net::Ipv6Addr>()
                .map(IpAddr::V6)
                .map_err(|e| Error::Decode(format!("invalid ip6 host {host}: {e}")))?,
            other => return Err(Error::Decode(format!("unsupported address family {other}"))),
        };

        if !matches!(*proto, "udp" | "quic" | "tcp") {
            return Err(Error::Decode(format!("unsupported transport {proto}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|e| Error::Decode(format!("invalid port {port}: {e}")))?;

        if !matches!(*id_tag, "id" | "p2p" | "ipfs") {
            return Err(Error::Decode(format!("expected /id/<peer>, found /{id_tag}/")));
        }
        let peer: PeerId = id.parse()?;

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            peer,
        })
    }
}
