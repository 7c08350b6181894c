//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration and load TLS material
//! - Build subsystems in dependency order (director, pool, TLS server)
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The listener binds last (traffic only when ready)

use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use thiserror::Error;
use tracing::Instrument;

use crate::config::validation::{validate_config, ValidationError};
use crate::config::{ConfigError, ProxyConfig, TrustConfig, TrustMode};
use crate::lifecycle::server::{self, ProxyHandle};
use crate::net::dialer::Dialer;
use crate::net::listener::{TransportAddr, TransportError, TransportListener};
use crate::net::tls::{CertError, ClientTrust, ServerIdentity, TlsClient, TlsServer, TrustPolicy};
use crate::relay::RelayContext;
use crate::routing::{BackendKey, BackendScheme, Director, RoutingError, StaticDirector};
use crate::upstream::{BackendPool, PoolSettings};

/// Why the proxy could not start.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load TLS material: {0}")]
    Cert(#[from] CertError),

    #[error("failed to start listener: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid backend: {0}")]
    Backend(#[from] RoutingError),

    #[error("https backend {0} needs a client trust policy")]
    MissingTrust(String),
}

/// A configured, not yet started proxy.
pub struct Proxy {
    config: ProxyConfig,
    identity: ServerIdentity,
    trust: Option<ClientTrust>,
    director: Option<Arc<dyn Director>>,
}

impl Proxy {
    /// Validate `config` and load the certificates it names.
    pub fn from_config(config: ProxyConfig) -> Result<Self, StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let identity = ServerIdentity::load(
            Path::new(&config.tls.cert_path),
            Path::new(&config.tls.key_path),
        )?;
        let trust = match &config.backend.trust {
            Some(trust) => Some(ClientTrust::load(&trust_policy(trust)?)?),
            None => None,
        };

        Ok(Self::new(config, identity, trust))
    }

    /// Build from already loaded TLS material.
    ///
    /// `trust` is required when the backend scheme is `https`.
    pub fn new(config: ProxyConfig, identity: ServerIdentity, trust: Option<ClientTrust>) -> Self {
        Self {
            config,
            identity,
            trust,
            director: None,
        }
    }

    /// Replace the default [`StaticDirector`].
    pub fn with_director(mut self, director: Arc<dyn Director>) -> Self {
        self.director = Some(director);
        self
    }

    /// Bind the listener and start serving in the background.
    pub async fn start(self) -> Result<ProxyHandle, StartupError> {
        let config = self.config;

        let director = match self.director {
            Some(director) => director,
            None => {
                let backend = BackendKey::new(config.backend.scheme, &config.backend.address)?;
                Arc::new(StaticDirector::new(backend)) as Arc<dyn Director>
            }
        };

        if config.backend.scheme == BackendScheme::Https && self.trust.is_none() {
            return Err(StartupError::MissingTrust(config.backend.address.clone()));
        }
        let tls_client = self.trust.as_ref().map(TlsClient::new).transpose()?;
        let dialer = Dialer::new(
            config.backend.connect_timeout(),
            tls_client,
            config.backend.server_name.clone(),
        );
        let pool = Arc::new(BackendPool::new(
            dialer,
            PoolSettings {
                max_connections: config.backend.max_connections,
                max_streams_per_connection: config.backend.max_streams_per_connection,
                idle_timeout: config.backend.idle_timeout(),
                keepalive: config.http2.keepalive(),
                http2: config.http2.clone(),
            },
        ));

        let tls = TlsServer::new(&self.identity, config.listener.handshake_timeout())?;
        let ctx = Arc::new(RelayContext {
            director,
            pool,
            tls,
            http2: config.http2.clone(),
            keepalive: config.http2.keepalive(),
            handshake_timeout: config.listener.handshake_timeout(),
            grace_period: config.shutdown.grace_period(),
            active_streams: AtomicUsize::new(0),
        });

        let address: TransportAddr = config.listener.bind_address.parse()?;
        let listener = TransportListener::bind(&address, config.listener.max_connections).await?;
        let local_addr = listener.local_addr();

        tracing::info!(
            listen = %local_addr,
            backend = %config.backend.address,
            scheme = config.backend.scheme.as_str(),
            grace_period_ms = config.shutdown.grace_period_ms,
            "Proxy started"
        );

        let handle = ProxyHandle::new(local_addr, ctx);
        tokio::spawn(
            server::accept_loop(listener, handle.clone())
                .instrument(tracing::info_span!("proxy", listen = %local_addr)),
        );
        Ok(handle)
    }
}

fn trust_policy(trust: &TrustConfig) -> Result<TrustPolicy, ConfigError> {
    match (trust.mode, &trust.ca_path) {
        (TrustMode::SkipVerify, _) => Ok(TrustPolicy::SkipVerify),
        (TrustMode::Verify, Some(ca_path)) => Ok(TrustPolicy::Verify {
            ca_path: ca_path.into(),
        }),
        (TrustMode::Verify, None) => Err(ConfigError::Validation(vec![ValidationError {
            field: "backend.trust.ca_path",
            message: "required when mode is verify".to_string(),
        }])),
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("listen", &self.config.listener.bind_address)
            .field("backend", &self.config.backend.address)
            .finish_non_exhaustive()
    }
}
