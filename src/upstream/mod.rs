//! Upstream (backend-facing) subsystem.
//!
//! # Data Flow
//! ```text
//! RouteDecision.backend
//!     → pool.rs (find a connection with a free stream slot, or dial)
//!     → connection.rs (lease a slot; driver task owns the h2 connection)
//!     → StreamLease handed to the relay, released on drop
//! ```
//!
//! # Design Decisions
//! - Streams to one backend are multiplexed over as few connections as the
//!   backend's concurrency limit allows
//! - Failed connections are evicted, never retried under a live stream

pub mod connection;
pub mod pool;

pub use connection::{PooledConnection, StreamLease};
pub use pool::{BackendPool, PoolError, PoolSettings, PoolStats};
