//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::keepalive::Keepalive;
use crate::routing::BackendScheme;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Inbound listener (transport address, limits).
    pub listener: ListenerConfig,

    /// Server identity presented to inbound callers.
    pub tls: TlsConfig,

    /// The backend every stream is relayed to.
    pub backend: BackendConfig,

    /// HTTP/2 settings applied to both legs.
    pub http2: Http2Config,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Transport address: `vsock://<cid|any|host>:<port>`, `tcp://<ip>:<port>`
    /// or a bare `<ip>:<port>`.
    pub bind_address: String,

    /// Maximum concurrent inbound connections (backpressure).
    pub max_connections: usize,

    /// Deadline for the TLS and HTTP/2 handshakes of an inbound connection.
    pub handshake_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "vsock://any:8443".to_string(),
            max_connections: 10_000,
            handshake_timeout_secs: 10,
        }
    }
}

impl ListenerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// TLS identity for the inbound listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "cert.pem".to_string(),
            key_path: "key.pem".to_string(),
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend authority (e.g., "127.0.0.1:50051").
    pub address: String,

    /// `https` (TLS, ALPN h2) or `http` (prior-knowledge h2).
    pub scheme: BackendScheme,

    /// SNI / verification name. Defaults to the host part of `address`.
    pub server_name: Option<String>,

    /// Certificate trust policy. Required for `https`; there is no default.
    pub trust: Option<TrustConfig>,

    /// TCP connect plus TLS handshake deadline in seconds.
    pub connect_timeout_secs: u64,

    /// Maximum pooled connections to the backend.
    pub max_connections: usize,

    /// Optional cap below the backend's advertised concurrent stream limit.
    pub max_streams_per_connection: Option<usize>,

    /// Close pooled connections idle for this long (0 disables).
    pub idle_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:50051".to_string(),
            scheme: BackendScheme::Https,
            server_name: None,
            trust: None,
            connect_timeout_secs: 5,
            max_connections: 4,
            max_streams_per_connection: None,
            idle_timeout_secs: 90,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// How the backend certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustMode {
    /// Verify against the CA bundle in `ca_path`.
    Verify,
    /// Accept any certificate. Test and development only.
    SkipVerify,
}

/// Backend trust policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrustConfig {
    pub mode: TrustMode,

    /// CA bundle (PEM), required by `verify`.
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// HTTP/2 settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    /// Initial per-stream receive window.
    pub initial_stream_window: u32,

    /// Initial connection-level receive window.
    pub initial_connection_window: u32,

    /// Largest DATA frame payload we accept.
    pub max_frame_size: u32,

    /// Concurrent streams advertised to inbound callers.
    pub max_concurrent_streams: u32,

    /// Upper bound of data buffered per stream waiting to be written.
    pub max_send_buffer_size: usize,

    /// PING interval on idle connections (0 disables).
    pub keepalive_interval_secs: u64,

    /// How long to wait for the PONG.
    pub keepalive_timeout_secs: u64,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_stream_window: 1024 * 1024,
            initial_connection_window: 2 * 1024 * 1024,
            max_frame_size: 16 * 1024,
            max_concurrent_streams: 256,
            max_send_buffer_size: 400 * 1024,
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 10,
        }
    }
}

impl Http2Config {
    /// Builder for the inbound (server) leg.
    pub fn server_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_stream_window)
            .initial_connection_window_size(self.initial_connection_window)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_send_buffer_size(self.max_send_buffer_size);
        builder
    }

    /// Builder for the outbound (client) leg.
    pub fn client_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_stream_window)
            .initial_connection_window_size(self.initial_connection_window)
            .max_frame_size(self.max_frame_size)
            .max_send_buffer_size(self.max_send_buffer_size)
            .enable_push(false);
        builder
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            interval: (self.keepalive_interval_secs > 0)
                .then(|| Duration::from_secs(self.keepalive_interval_secs)),
            timeout: Duration::from_secs(self.keepalive_timeout_secs),
        }
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight streams get to finish before they are reset.
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
