//! Outbound connection establishment.
//!
//! TCP connect followed by a TLS client handshake (`https`) or nothing at all
//! (`http`, prior-knowledge HTTP/2). The whole sequence runs under one
//! connect deadline.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::net::listener::BoxedIo;
use crate::net::tls::{HandshakeError, TlsClient};
use crate::routing::{BackendKey, BackendScheme};

/// Failure to reach a backend.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to connect to {backend}: {source}")]
    Connect {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {backend} timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    #[error("TLS with {backend} failed: {source}")]
    Handshake {
        backend: String,
        #[source]
        source: HandshakeError,
    },

    #[error("no TLS client configured for https backend {0}")]
    TlsNotConfigured(String),
}

/// Opens raw connections to backends.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    tls: Option<TlsClient>,
    /// Overrides the SNI / verification name derived from the authority.
    server_name: Option<String>,
}

impl Dialer {
    pub fn new(connect_timeout: Duration, tls: Option<TlsClient>, server_name: Option<String>) -> Self {
        Self {
            connect_timeout,
            tls,
            server_name,
        }
    }

    /// Connect to `backend` and complete the TLS handshake if its scheme needs one.
    pub async fn dial(&self, backend: &BackendKey) -> Result<BoxedIo, DialError> {
        tokio::time::timeout(self.connect_timeout, self.connect(backend))
            .await
            .map_err(|_| DialError::Timeout {
                backend: backend.to_string(),
                after: self.connect_timeout,
            })?
    }

    async fn connect(&self, backend: &BackendKey) -> Result<BoxedIo, DialError> {
        let host = backend.host();
        let stream = TcpStream::connect((host, backend.port()))
            .await
            .and_then(|stream| {
                stream.set_nodelay(true)?;
                Ok(stream)
            })
            .map_err(|source| DialError::Connect {
                backend: backend.to_string(),
                source,
            })?;

        match backend.scheme {
            BackendScheme::Http => Ok(Box::new(stream)),
            BackendScheme::Https => {
                let tls = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| DialError::TlsNotConfigured(backend.to_string()))?;
                let server_name = self.server_name.as_deref().unwrap_or(host);
                let stream = tls
                    .connect(server_name, Box::new(stream))
                    .await
                    .map_err(|source| DialError::Handshake {
                        backend: backend.to_string(),
                        source,
                    })?;
                tracing::debug!(backend = %backend, server_name, "Backend TLS established");
                Ok(Box::new(stream))
            }
        }
    }
}
