//! Public error type.
//!
//! Internal plumbing (RPC framing, TLS setup, stream IO) uses `anyhow` the
//! same way the protocol traits do; everything that crosses the [`Node`]
//! boundary is converted into [`Error`] so callers can match on the failure
//! kind.
//!
//! [`Node`]: crate::Node

use std::net::SocketAddr;
use std::path::PathBuf;

/// Failures surfaced by the node, the content routing table and the
/// broadcast channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS entropy source or key derivation failed.
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// A serialized identity, address or key could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A key file could not be written.
    #[error("failed to write key file {}: {source}", path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An outbound connection did not complete within its timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// TLS failed or the remote peer is not who the address claims.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No peer answered an iterative lookup within the configured bound.
    #[error("lookup timed out: no peer responded")]
    LookupTimeout,

    /// Publish found no connected peers. Local subscribers still got the message.
    #[error("no connected peers")]
    NotConnected,

    /// The caller's deadline passed or its token was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Topic or payload rejected before it reached the network.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A configuration value was rejected by validation.
    #[error("invalid config: {0}")]
    Config(String),

    /// The node (or one of its actors) has shut down.
    #[error("node is shut down")]
    Shutdown,
}

/// Result alias for public APIs.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the variants a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::LookupTimeout | Error::NotConnected
        )
    }
}
