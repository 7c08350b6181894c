//! HTTP/2 frame relay.
//!
//! # Data Flow
//! ```text
//! TLS stream (inbound)
//!     → connection.rs (h2 server; one task per connection, streams multiplexed)
//!     → stream.rs (route, lease upstream stream, relay both directions)
//!         → body.rs (DATA + trailers, flow-controlled, each direction)
//!     → pairing.rs (phase + forced-reset handle per pairing)
//!     → status.rs (gRPC status when the proxy ends a stream itself)
//! ```
//!
//! # Design Decisions
//! - Each inbound stream maps to exactly one outbound stream
//! - Frames of one direction are forwarded in arrival order
//! - Failures end the affected stream with a gRPC status or a mirrored reset;
//!   sibling streams and the connection stay up

use std::error::Error as StdError;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use h2::Reason;
use thiserror::Error;

use crate::config::Http2Config;
use crate::net::keepalive::Keepalive;
use crate::net::tls::TlsServer;
use crate::routing::{Director, RoutingError};
use crate::upstream::BackendPool;

pub mod body;
pub mod connection;
pub mod pairing;
pub mod status;
pub mod stream;

pub use connection::serve_connection;
pub use stream::relay_stream;

/// How a relayed stream ended abnormally.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("backend unavailable: {0}")]
    UpstreamUnavailable(#[source] Box<dyn StdError + Send + Sync>),

    #[error("backend reset stream: {0}")]
    UpstreamReset(Reason),

    #[error("client disconnected")]
    ClientDisconnected(#[source] Option<h2::Error>),

    #[error("stream reset by shutdown")]
    Shutdown,
}

impl RelayError {
    pub(crate) fn unavailable(source: impl StdError + Send + Sync + 'static) -> Self {
        RelayError::UpstreamUnavailable(Box::new(source))
    }

    /// Whether the backend connection under the stream is broken.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            RelayError::UpstreamUnavailable(source) => source
                .downcast_ref::<h2::Error>()
                .is_some_and(|e| e.is_io() || e.is_go_away()),
            _ => false,
        }
    }

    /// Label for the stream outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            RelayError::Routing(_) => "routing_error",
            RelayError::UpstreamUnavailable(_) => "upstream_unavailable",
            RelayError::UpstreamReset(_) => "upstream_reset",
            RelayError::ClientDisconnected(_) => "client_disconnected",
            RelayError::Shutdown => "shutdown",
        }
    }
}

/// Everything a connection task needs, shared by all connections.
#[derive(Debug)]
pub struct RelayContext {
    pub director: Arc<dyn Director>,
    pub pool: Arc<BackendPool>,
    pub tls: TlsServer,
    pub http2: Http2Config,
    pub keepalive: Keepalive,
    /// Deadline for the TLS + HTTP/2 handshakes.
    pub handshake_timeout: Duration,
    /// Time in-flight streams get after shutdown begins.
    pub grace_period: Duration,
    /// Paired streams currently in flight across all connections.
    pub active_streams: AtomicUsize,
}
