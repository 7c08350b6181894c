//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming vsock / TCP connection
//!     → listener.rs (accept, connection limits)
//!     → tls.rs (server handshake, ALPN h2)
//!     → connection.rs (id, lifecycle tracking)
//!     → Hand off to relay layer
//!
//! Outbound:
//!     upstream pool
//!     → dialer.rs (TCP connect, deadline)
//!     → tls.rs (client handshake, ALPN h2)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Transport details stop at listener.rs; everything above sees a byte stream

pub mod connection;
pub mod dialer;
pub mod keepalive;
pub mod listener;
pub mod tls;
