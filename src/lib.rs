//! vsock2http2: gRPC reverse proxy from vsock to an HTTP/2 backend.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌────────────────────────────────────────────────────────┐
//!                 │                      vsock2http2                        │
//!                 │                                                         │
//!   Caller        │  ┌─────────┐   ┌──────────┐   ┌──────────┐              │
//!   (vsock, TLS) ─┼─▶│   net   │──▶│  relay   │──▶│ routing  │              │
//!                 │  │listener │   │h2 server │   │ director │              │
//!                 │  │  + tls  │   │ + pairing│   └────┬─────┘              │
//!                 │  └─────────┘   └────┬─────┘        │                    │
//!                 │                     │              ▼                    │
//!                 │                     │        ┌──────────┐  ┌────────┐   │
//!                 │                     └───────▶│ upstream │─▶│ dialer │───┼──▶ Backend
//!                 │                       frames │   pool   │  │TCP/TLS │   │   (gRPC, h2)
//!                 │                              └──────────┘  └────────┘   │
//!                 │                                                         │
//!                 │  ┌───────────────────────────────────────────────────┐  │
//!                 │  │ config │ lifecycle (startup/stop) │ observability │  │
//!                 │  └───────────────────────────────────────────────────┘  │
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! Every inbound HTTP/2 stream is paired with one stream on a pooled backend
//! connection. HEADERS, DATA and trailers are forwarded in order in both
//! directions, and resets propagate across the pairing. The proxy never
//! buffers whole messages; flow control is end to end.

// Core subsystems
pub mod config;
pub mod net;
pub mod relay;
pub mod routing;
pub mod upstream;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ProxyConfig;
pub use lifecycle::{Proxy, ProxyHandle, ProxyStats, StartupError};
pub use net::listener::TransportAddr;
pub use routing::{BackendKey, BackendScheme, Director, RouteDecision, RoutingError};
