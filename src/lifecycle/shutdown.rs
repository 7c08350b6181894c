//! Shutdown coordination for the proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Long-running tasks hold child tokens of the root token. Triggering is
/// idempotent; only the first call reports `true`.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled when shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger the shutdown signal. Returns whether this call triggered it.
    pub fn trigger(&self) -> bool {
        let first = !self.triggered.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Wait for the shutdown signal.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}
