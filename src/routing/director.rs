//! Per-stream routing decisions.
//!
//! # Responsibilities
//! - Decide which backend (scheme + authority) serves a stream
//! - Reject requests that lack the input a decision needs
//!
//! # Design Decisions
//! - A decision is computed once from the request head and never changes
//! - [`Director`] is the seam for other policies; the proxy ships
//!   [`StaticDirector`], which sends everything to one backend
//! - No method-level routing: the gRPC service/method in `:path` is
//!   validated, not interpreted

use std::fmt;
use std::str::FromStr;

use http::request::Parts;
use http::uri::{Authority, Scheme};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a stream could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("request has no :path")]
    MissingPath,

    #[error("malformed request path `{0}`")]
    MalformedPath(String),

    #[error("invalid backend authority `{0}`")]
    InvalidAuthority(String),

    #[error("cannot build upstream request: {0}")]
    Rewrite(String),
}

/// Transport security towards the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendScheme {
    /// TLS with ALPN `h2`.
    #[default]
    Https,
    /// Prior-knowledge HTTP/2 over plain TCP.
    Http,
}

impl BackendScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendScheme::Https => "https",
            BackendScheme::Http => "http",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            BackendScheme::Https => 443,
            BackendScheme::Http => 80,
        }
    }

    pub fn uri_scheme(&self) -> Scheme {
        match self {
            BackendScheme::Https => Scheme::HTTPS,
            BackendScheme::Http => Scheme::HTTP,
        }
    }
}

impl FromStr for BackendScheme {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "https" => Ok(BackendScheme::Https),
            "http" => Ok(BackendScheme::Http),
            other => Err(RoutingError::InvalidAuthority(format!("unknown scheme {other}"))),
        }
    }
}

/// Identity of a backend: what the connection pool is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendKey {
    pub scheme: BackendScheme,
    pub authority: Authority,
}

impl BackendKey {
    pub fn new(scheme: BackendScheme, authority: &str) -> Result<Self, RoutingError> {
        let authority = Authority::from_str(authority)
            .map_err(|_| RoutingError::InvalidAuthority(authority.to_string()))?;
        if authority.as_str().contains('@') {
            return Err(RoutingError::InvalidAuthority(authority.to_string()));
        }
        Ok(Self { scheme, authority })
    }

    /// Parse `scheme://authority`; a bare authority means `https`.
    pub fn parse(s: &str) -> Result<Self, RoutingError> {
        match s.split_once("://") {
            Some((scheme, authority)) => Self::new(scheme.parse()?, authority),
            None => Self::new(BackendScheme::Https, s),
        }
    }

    /// Host without IPv6 brackets, suitable for connecting and SNI.
    pub fn host(&self) -> &str {
        self.authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.authority
            .port_u16()
            .unwrap_or_else(|| self.scheme.default_port())
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority)
    }
}

/// Where one stream goes. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub backend: BackendKey,
}

/// Routing policy.
pub trait Director: Send + Sync + fmt::Debug {
    /// Decide the backend for an inbound request head.
    fn route(&self, head: &Parts) -> Result<RouteDecision, RoutingError>;
}

/// Routes every well-formed request to one fixed backend.
#[derive(Debug, Clone)]
pub struct StaticDirector {
    backend: BackendKey,
}

impl StaticDirector {
    pub fn new(backend: BackendKey) -> Self {
        Self { backend }
    }
}

impl Director for StaticDirector {
    fn route(&self, head: &Parts) -> Result<RouteDecision, RoutingError> {
        validate_path(head)?;
        Ok(RouteDecision {
            backend: self.backend.clone(),
        })
    }
}

/// A routable request has an origin-form `:path`.
pub fn validate_path(head: &Parts) -> Result<(), RoutingError> {
    let path = head
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|p| !p.is_empty())
        .ok_or(RoutingError::MissingPath)?;
    if !path.starts_with('/') {
        return Err(RoutingError::MalformedPath(path.to_string()));
    }
    Ok(())
}
