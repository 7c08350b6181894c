//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Load TLS material → Build pool + director → Bind listener
//!
//! Serving (server.rs):
//!     Accept loop → one task per connection → ProxyHandle for control
//!
//! Shutdown (shutdown.rs):
//!     stop() → Stop accepting → GOAWAY + drain → Reset stragglers → Close pool
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: the grace period, then forced resets

pub mod server;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use server::{ProxyHandle, ProxyStats};
pub use shutdown::Shutdown;
pub use startup::{Proxy, StartupError};
