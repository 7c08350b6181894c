//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request head (:method, :path, metadata)
//!     → director.rs (Director::route → RouteDecision)
//!     → rewrite.rs (replace :scheme/:authority, copy metadata in order)
//!     → outbound request head for the pooled backend connection
//! ```
//!
//! # Design Decisions
//! - Decisions are computed once per stream
//! - Deterministic: same input always yields the same backend
//! - Routing failures are per-stream; siblings on the connection are unaffected

pub mod director;
pub mod rewrite;

pub use director::{BackendKey, BackendScheme, Director, RouteDecision, RoutingError, StaticDirector};
pub use rewrite::rewrite_request;
