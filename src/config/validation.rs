//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check addresses parse (listener transport, backend authority, metrics)
//! - Validate value ranges (limits > 0, HTTP/2 window and frame bounds)
//! - Require an explicit trust policy for TLS backends
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{ProxyConfig, TrustMode};
use crate::net::listener::TransportAddr;
use crate::routing::{BackendKey, BackendScheme};

/// Largest legal HTTP/2 flow-control window (RFC 9113 §6.9.1).
const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration, collecting every error found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = config.listener.bind_address.parse::<TransportAddr>() {
        errors.push(ValidationError::new("listener.bind_address", e.to_string()));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than zero",
        ));
    }
    if config.listener.handshake_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "listener.handshake_timeout_secs",
            "must be greater than zero",
        ));
    }

    if config.tls.cert_path.is_empty() {
        errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
    }
    if config.tls.key_path.is_empty() {
        errors.push(ValidationError::new("tls.key_path", "must not be empty"));
    }

    validate_backend(config, &mut errors);
    validate_http2(config, &mut errors);

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!(
                "`{}` is not a socket address",
                config.observability.metrics_address
            ),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_backend(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let backend = &config.backend;

    match BackendKey::new(backend.scheme, &backend.address) {
        Ok(key) if key.authority.port_u16().is_none() => errors.push(ValidationError::new(
            "backend.address",
            format!("`{}` has no port", backend.address),
        )),
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::new("backend.address", e.to_string())),
    }

    if backend.max_connections == 0 {
        errors.push(ValidationError::new(
            "backend.max_connections",
            "must be greater than zero",
        ));
    }
    if backend.max_streams_per_connection == Some(0) {
        errors.push(ValidationError::new(
            "backend.max_streams_per_connection",
            "must be greater than zero when set",
        ));
    }
    if backend.connect_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "backend.connect_timeout_secs",
            "must be greater than zero",
        ));
    }

    match (&backend.trust, backend.scheme) {
        (None, BackendScheme::Https) => errors.push(ValidationError::new(
            "backend.trust",
            "https backends need an explicit trust policy (verify or skip-verify)",
        )),
        (Some(trust), _) if trust.mode == TrustMode::Verify && trust.ca_path.is_none() => {
            errors.push(ValidationError::new(
                "backend.trust.ca_path",
                "required when mode is verify",
            ))
        }
        _ => {}
    }
}

fn validate_http2(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let http2 = &config.http2;

    if http2.initial_stream_window > MAX_WINDOW_SIZE {
        errors.push(ValidationError::new(
            "http2.initial_stream_window",
            format!("must not exceed {MAX_WINDOW_SIZE}"),
        ));
    }
    if http2.initial_connection_window > MAX_WINDOW_SIZE {
        errors.push(ValidationError::new(
            "http2.initial_connection_window",
            format!("must not exceed {MAX_WINDOW_SIZE}"),
        ));
    }
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&http2.max_frame_size) {
        errors.push(ValidationError::new(
            "http2.max_frame_size",
            format!("must be within {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}"),
        ));
    }
    if http2.max_concurrent_streams == 0 {
        errors.push(ValidationError::new(
            "http2.max_concurrent_streams",
            "must be greater than zero",
        ));
    }
    if http2.max_send_buffer_size == 0 {
        errors.push(ValidationError::new(
            "http2.max_send_buffer_size",
            "must be greater than zero",
        ));
    }
    if http2.keepalive_interval_secs > 0 && http2.keepalive_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "http2.keepalive_timeout_secs",
            "must be greater than zero when keepalive is enabled",
        ));
    }
}
