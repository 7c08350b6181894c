//! TLS termination and origination with ALPN `h2`.
//!
//! # Responsibilities
//! - Load the server identity (certificate chain + key) from PEM
//! - Load the client trust policy used towards the backend
//! - Run server and client handshakes under a deadline
//! - Refuse any session that did not negotiate `h2`
//!
//! # Design Decisions
//! - The ring provider is selected explicitly so no process-wide default
//!   provider has to be installed
//! - Skipping verification is a named policy that must be configured; it is
//!   never a fallback

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::net::listener::BoxedIo;

/// ALPN identifier for HTTP/2 over TLS.
pub const ALPN_H2: &[u8] = b"h2";

/// Failure to load certificates, keys or trust anchors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed PEM in {what}: {source}")]
    Pem {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failure while establishing a TLS session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer did not negotiate h2 (got {})", negotiated.as_deref().unwrap_or("nothing"))]
    AlpnMismatch { negotiated: Option<String> },

    #[error("invalid TLS server name `{0}`")]
    InvalidServerName(String),

    #[error("HTTP/2 handshake failed: {0}")]
    Http2(#[source] h2::Error),

    #[error("handshake abandoned for shutdown")]
    Aborted,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertError> {
    std::fs::read(path).map_err(|source| CertError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(mut pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::Pem {
            what: what.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(CertError::NoCertificates(what.to_string()));
    }
    Ok(certs)
}

/// Certificate chain and private key presented to inbound callers.
pub struct ServerIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    /// Load a PEM certificate chain and PEM private key from disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        Self::parse(
            &cert_pem,
            &cert_path.display().to_string(),
            &key_pem,
            &key_path.display().to_string(),
        )
    }

    /// Build an identity from in-memory PEM.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        Self::parse(cert_pem, "certificate PEM", key_pem, "key PEM")
    }

    fn parse(
        cert_pem: &[u8],
        cert_what: &str,
        mut key_pem: &[u8],
        key_what: &str,
    ) -> Result<Self, CertError> {
        let certs = parse_certs(cert_pem, cert_what)?;
        let key = rustls_pemfile::private_key(&mut key_pem)
            .map_err(|source| CertError::Pem {
                what: key_what.to_string(),
                source,
            })?
            .ok_or_else(|| CertError::NoPrivateKey(key_what.to_string()))?;
        Ok(Self { certs, key })
    }
}

impl Clone for ServerIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// How backend certificates are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    Verify { ca_path: PathBuf },
    SkipVerify,
}

/// Loaded trust anchors for the client leg.
#[derive(Debug, Clone)]
pub enum ClientTrust {
    Roots(Arc<RootCertStore>),
    SkipVerify,
}

impl ClientTrust {
    pub fn load(policy: &TrustPolicy) -> Result<Self, CertError> {
        match policy {
            TrustPolicy::SkipVerify => Ok(ClientTrust::SkipVerify),
            TrustPolicy::Verify { ca_path } => {
                let pem = read_file(ca_path)?;
                Self::parse_ca(&pem, &ca_path.display().to_string())
            }
        }
    }

    /// Trust exactly the certificates in a PEM bundle.
    pub fn from_ca_pem(pem: &[u8]) -> Result<Self, CertError> {
        Self::parse_ca(pem, "CA PEM")
    }

    fn parse_ca(pem: &[u8], what: &str) -> Result<Self, CertError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(pem, what)? {
            roots.add(cert)?;
        }
        Ok(ClientTrust::Roots(Arc::new(roots)))
    }
}

/// Server side of the TLS terminator.
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsServer {
    pub fn new(identity: &ServerIdentity, handshake_timeout: Duration) -> Result<Self, CertError> {
        let identity = identity.clone();
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(identity.certs, identity.key)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handshake_timeout,
        })
    }

    /// Complete the server handshake and check the negotiated protocol.
    pub async fn accept(&self, io: BoxedIo) -> Result<server::TlsStream<BoxedIo>, HandshakeError> {
        let stream = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(io))
            .await
            .map_err(|_| HandshakeError::Timeout(self.handshake_timeout))?
            .map_err(HandshakeError::Tls)?;

        check_alpn(stream.get_ref().1.alpn_protocol())?;
        Ok(stream)
    }
}

impl fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServer")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Client side of the TLS terminator.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    pub fn new(trust: &ClientTrust) -> Result<Self, CertError> {
        let provider = provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;
        let mut config = match trust {
            ClientTrust::Roots(roots) => builder
                .with_root_certificates(Arc::clone(roots))
                .with_no_client_auth(),
            ClientTrust::SkipVerify => {
                tracing::warn!("Backend certificate verification is disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
                    .with_no_client_auth()
            }
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Run the client handshake. The caller bounds it with its own deadline.
    pub async fn connect(
        &self,
        server_name: &str,
        io: BoxedIo,
    ) -> Result<client::TlsStream<BoxedIo>, HandshakeError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| HandshakeError::InvalidServerName(server_name.to_string()))?;
        let stream = self
            .connector
            .connect(name, io)
            .await
            .map_err(HandshakeError::Tls)?;

        check_alpn(stream.get_ref().1.alpn_protocol())?;
        Ok(stream)
    }
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}

fn check_alpn(negotiated: Option<&[u8]>) -> Result<(), HandshakeError> {
    match negotiated {
        Some(ALPN_H2) => Ok(()),
        other => Err(HandshakeError::AlpnMismatch {
            negotiated: other.map(|p| String::from_utf8_lossy(p).into_owned()),
        }),
    }
}

/// Accepts any backend certificate but still checks handshake signatures.
///
/// # Warning
/// This disables authentication of the backend. Development and tests only.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
