//! Accept loop and the running proxy's handle.
//!
//! # Data Flow
//! ```text
//! accept_loop
//!     → TransportListener::accept (permit-bounded)
//!     → spawn connection task (JoinSet): TLS → HTTP/2 → relay
//!
//! ProxyHandle::stop
//!     → Shutdown::trigger
//!     → accept loop drops the listener
//!     → connections send GOAWAY, drain for the grace period, reset the rest
//!     → backend pool closed
//!     → every stop() caller resumes
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{TransportAddr, TransportError, TransportListener};
use crate::net::tls::HandshakeError;
use crate::observability::metrics;
use crate::relay::{serve_connection, RelayContext};

/// Extra time past the grace period for connection tasks to flush resets.
const DRAIN_MARGIN: Duration = Duration::from_secs(1);

/// Point-in-time counters of a running proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyStats {
    /// Inbound connections being served.
    pub active_connections: u64,
    /// Paired streams in flight.
    pub active_streams: usize,
    /// Open backend connections.
    pub backend_connections: usize,
    /// Backend connection attempts since start.
    pub backend_dials: u64,
}

#[derive(Debug)]
struct Inner {
    local_addr: TransportAddr,
    ctx: Arc<RelayContext>,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    /// Cancelled once teardown has completed.
    finished: CancellationToken,
}

/// Handle to a running proxy. Cheap to clone; all clones control the same proxy.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    inner: Arc<Inner>,
}

impl ProxyHandle {
    pub(crate) fn new(local_addr: TransportAddr, ctx: Arc<RelayContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_addr,
                ctx,
                shutdown: Shutdown::new(),
                tracker: ConnectionTracker::new(),
                finished: CancellationToken::new(),
            }),
        }
    }

    /// The address the listener is bound to (resolved port for `:0`).
    pub fn local_addr(&self) -> TransportAddr {
        self.inner.local_addr
    }

    pub fn stats(&self) -> ProxyStats {
        let pool = self.inner.ctx.pool.stats();
        ProxyStats {
            active_connections: self.inner.tracker.active_count(),
            active_streams: self.inner.ctx.active_streams.load(Ordering::Relaxed),
            backend_connections: pool.connections,
            backend_dials: pool.dials,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_triggered()
    }

    /// Gracefully stop the proxy and wait until teardown completes.
    ///
    /// Idempotent; concurrent callers all wait for the same teardown.
    pub async fn stop(&self) {
        if self.inner.shutdown.trigger() {
            tracing::info!(
                listen = %self.inner.local_addr,
                grace_period = ?self.inner.ctx.grace_period,
                "Shutdown requested"
            );
        }
        self.wait().await;
    }

    /// Wait until the proxy has stopped, without requesting it.
    pub async fn wait(&self) {
        self.inner.finished.cancelled().await;
    }
}

/// Accept connections until shutdown, then drain and tear down.
pub(crate) async fn accept_loop(mut listener: TransportListener, handle: ProxyHandle) {
    let inner = &handle.inner;
    let shutdown = inner.shutdown.token();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((io, peer, permit)) => {
                    let guard = inner.tracker.track();
                    let id = guard.id();
                    let ctx = Arc::clone(&inner.ctx);
                    let shutdown = shutdown.clone();
                    metrics::record_connection_accepted(if peer.is_vsock() { "vsock" } else { "tcp" });

                    connections.spawn(
                        async move {
                            let _permit = permit;
                            let _guard = guard;
                            match serve_connection(io, peer, id, ctx, shutdown).await {
                                Ok(()) | Err(HandshakeError::Aborted) => {}
                                Err(e) => tracing::info!(error = %e, "Handshake failed"),
                            }
                            metrics::record_connection_closed();
                        }
                        .instrument(tracing::info_span!("connection", connection_id = %id, peer = %peer)),
                    );
                }
                Err(TransportError::Closed) => break,
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => log_join(joined),
        }
    }

    // New connection attempts are refused from here on.
    listener.close();
    drop(listener);
    tracing::info!(connections = connections.len(), "Listener closed, draining connections");

    let drain = async {
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
    };
    if tokio::time::timeout(inner.ctx.grace_period + DRAIN_MARGIN, drain)
        .await
        .is_err()
    {
        tracing::warn!(remaining = connections.len(), "Connections did not drain, aborting");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    inner.ctx.pool.close();
    tracing::info!("Shutdown complete");
    inner.finished.cancel();
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Connection task panicked");
        }
    }
}
