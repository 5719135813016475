//! # Cryptographic Infrastructure
//!
//! - **Signatures**: domain-separated Ed25519 signing for flooded messages
//! - **TLS**: self-signed Ed25519 certificates and mutual-auth QUIC configs
//!
//! ## Identity Binding
//!
//! A peer's [`PeerId`] is `blake3(public key)`. The client puts the PeerId it
//! expects into the SNI (two 32-hex-char labels) and the server certificate
//! verifier rejects any certificate whose key does not hash to it. Servers
//! require a client certificate and derive the client's PeerId from it after
//! the handshake with [`extract_verified_peer`].
//!
//! No CA is involved; `dangerous()` verifier hooks are used on purpose to bind
//! trust to the key hash instead of a certificate chain.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::{ClientConfig, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, PeerId};

/// ALPN protocol identifier for every swarmlink connection.
pub const ALPN: &[u8] = b"swarmlink/1";

/// Domain separation prefix for flooded message signatures.
pub const FLOODSUB_SIGNATURE_DOMAIN: &[u8] = b"swarmlink-floodsub-v1:";

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_CONCURRENT_BIDI_STREAMS: u32 = 128;

static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

// ============================================================================
// Domain-Separated Signatures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    VerificationFailed,
}

fn domain_message(domain: &[u8], data: &[u8]) -> Vec<u8> {
    [domain, data].concat()
}

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&domain_message(domain, data)).to_bytes().to_vec()
}

pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    let signer =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| SignatureError::InvalidLength)?;
    signer
        .verify_strict(&domain_message(domain, data), &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Certificates
// ============================================================================

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    // PKCS#8 v1 wrapping of a raw Ed25519 seed (RFC 8410).
    const PKCS8_ED25519_PREFIX: [u8; 16] = [
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
        0x04, 0x20,
    ];

    let mut pkcs8 = Vec::with_capacity(PKCS8_ED25519_PREFIX.len() + 32);
    pkcs8.extend_from_slice(&PKCS8_ED25519_PREFIX);
    pkcs8.extend_from_slice(&keypair.secret_key_bytes());

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to load Ed25519 key for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["swarmlink".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.peer_id().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    Ok((vec![CertificateDer::from(cert.der().to_vec())], key))
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes: &[u8] = &cert.public_key().subject_public_key.data;
    key_bytes.try_into().ok()
}

/// PeerId of the remote side, derived from the certificate it presented.
pub fn extract_verified_peer(connection: &quinn::Connection) -> Option<PeerId> {
    let identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer<'static>> = identity.downcast_ref()?;
    let public_key = extract_public_key_from_cert(certs.first()?.as_ref())?;
    Some(PeerId::from_public_key(&public_key))
}

pub(crate) fn peer_to_sni(peer: &PeerId) -> String {
    let hex = peer.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn peer_from_sni(sni: &str) -> Option<PeerId> {
    let joined: String = sni.split('.').collect();
    joined.parse().ok()
}

// ============================================================================
// QUIC Configs
// ============================================================================

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of range")?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_BIDI_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    Ok(transport)
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_client_cert_verifier(Arc::new(PeerCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));
    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PeerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));
    Ok(client_config)
}

// ============================================================================
// Verifiers
// ============================================================================

type SignatureCheck = std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>;

fn bad_cert(reason: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(reason)
}

/// Binds trust to the certificate key instead of a chain.
///
/// As a server it accepts any well-formed Ed25519 client certificate, the
/// PeerId being derived after the handshake. As a client it requires the
/// server key to hash to the PeerId carried in the SNI.
#[derive(Debug)]
struct PeerCertVerifier;

impl PeerCertVerifier {
    fn peer_of(end_entity: &CertificateDer<'_>) -> std::result::Result<PeerId, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or_else(|| bad_cert(rustls::CertificateError::BadEncoding))?;
        VerifyingKey::from_bytes(&public_key)
            .map_err(|_| bad_cert(rustls::CertificateError::ApplicationVerificationFailure))?;
        Ok(PeerId::from_public_key(&public_key))
    }

    fn tls12(message: &[u8], cert: &CertificateDer<'_>, dss: &rustls::DigitallySignedStruct) -> SignatureCheck {
        let algorithms = &CRYPTO_PROVIDER.signature_verification_algorithms;
        rustls::crypto::verify_tls12_signature(message, cert, dss, algorithms)
    }

    fn tls13(message: &[u8], cert: &CertificateDer<'_>, dss: &rustls::DigitallySignedStruct) -> SignatureCheck {
        let algorithms = &CRYPTO_PROVIDER.signature_verification_algorithms;
        rustls::crypto::verify_tls13_signature(message, cert, dss, algorithms)
    }
}

impl rustls::server::danger::ClientCertVerifier for PeerCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Self::peer_of(end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> SignatureCheck {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> SignatureCheck {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl rustls::client::danger::ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(bad_cert(rustls::CertificateError::ApplicationVerificationFailure));
        };
        let expected = peer_from_sni(name.as_ref())
            .ok_or_else(|| bad_cert(rustls::CertificateError::BadEncoding))?;
        if Self::peer_of(end_entity)? != expected {
            return Err(bad_cert(rustls::CertificateError::NotValidForName));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> SignatureCheck {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> SignatureCheck {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
