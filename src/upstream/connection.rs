//! One pooled HTTP/2 connection to a backend.
//!
//! # Responsibilities
//! - Hand out stream slots up to the connection's concurrency limit
//! - Track in-flight streams and last activity (for idle eviction)
//! - Drive the h2 client connection until it fails, idles out or is evicted
//!
//! # Design Decisions
//! - The limit is the lesser of the backend's advertised
//!   `SETTINGS_MAX_CONCURRENT_STREAMS` and the configured cap
//! - Slots are leased with a guard; dropping the guard frees the slot
//! - Idle retirement swaps the in-flight count from zero to a sentinel, so a
//!   retiring connection can never hand out a slot

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::{Connection, SendRequest};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::net::connection::ConnectionId;
use crate::net::keepalive::{self, Keepalive};
use crate::routing::BackendKey;

/// Shortest period between idle checks.
const MIN_IDLE_CHECK: Duration = Duration::from_millis(50);

/// In-flight value of a connection retired for idleness.
const RETIRED: usize = 1 << (usize::BITS - 1);

/// An established outbound connection shared by many streams.
#[derive(Debug)]
pub struct PooledConnection {
    id: ConnectionId,
    backend: BackendKey,
    sender: SendRequest<Bytes>,
    /// Configured per-connection stream cap.
    stream_cap: Option<usize>,
    /// Number of streams currently leased.
    in_flight: AtomicUsize,
    created: Instant,
    /// Milliseconds since `created` of the last lease release.
    last_active_ms: AtomicU64,
    closing: CancellationToken,
}

impl PooledConnection {
    pub(crate) fn new(
        id: ConnectionId,
        backend: BackendKey,
        sender: SendRequest<Bytes>,
        stream_cap: Option<usize>,
        closing: CancellationToken,
    ) -> Self {
        Self {
            id,
            backend,
            sender,
            stream_cap,
            in_flight: AtomicUsize::new(0),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            closing,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn backend(&self) -> &BackendKey {
        &self.backend
    }

    /// Get the current number of leased streams.
    pub fn in_flight(&self) -> usize {
        match self.in_flight.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }

    /// Concurrent streams this connection may carry right now.
    pub fn stream_limit(&self) -> usize {
        let advertised = self.sender.current_max_send_streams();
        self.stream_cap.map_or(advertised, |cap| cap.min(advertised))
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Stop handing out streams and tear the connection down.
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Lease a stream slot if the connection is below its limit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<StreamLease> {
        let limit = self.stream_limit();
        let mut prev = self.in_flight.load(Ordering::Acquire);
        loop {
            if prev >= limit || prev >= RETIRED || self.is_closed() {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(StreamLease {
            connection: Arc::clone(self),
        })
    }

    /// Lease a slot regardless of the limit. The stream then waits in
    /// `SendRequest::ready` until the backend grants capacity.
    ///
    /// Returns `None` only once the connection is closing.
    pub fn acquire_queued(self: &Arc<Self>) -> Option<StreamLease> {
        let mut prev = self.in_flight.load(Ordering::Acquire);
        loop {
            if prev >= RETIRED || self.is_closed() {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(StreamLease {
            connection: Arc::clone(self),
        })
    }

    fn release(&self) {
        self.last_active_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Release);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn idle_for(&self) -> Option<Duration> {
        if self.in_flight() > 0 {
            return None;
        }
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Acquire));
        Some(self.created.elapsed().saturating_sub(last))
    }

    /// Close the connection if it has had no streams for `timeout`.
    ///
    /// The in-flight count moves from zero to `RETIRED` before the idle time
    /// is checked, so no lease can be handed out between the check and the
    /// close.
    fn retire_if_idle(&self, timeout: Duration) -> bool {
        if self
            .in_flight
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Acquire));
        if self.created.elapsed().saturating_sub(last) < timeout {
            self.in_flight.store(0, Ordering::Release);
            return false;
        }
        self.close();
        true
    }

    /// Resolve once the connection has been retired for idleness.
    async fn idle_expired(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return std::future::pending().await;
        };
        let mut ticker = tokio::time::interval((timeout / 4).max(MIN_IDLE_CHECK));
        loop {
            ticker.tick().await;
            let expired = self.idle_for().is_some_and(|idle| idle >= timeout);
            if expired && self.retire_if_idle(timeout) {
                return;
            }
        }
    }
}

/// A leased stream slot on a pooled connection.
///
/// Decrements the in-flight count when dropped.
#[derive(Debug)]
pub struct StreamLease {
    connection: Arc<PooledConnection>,
}

impl StreamLease {
    /// A request handle bound to the leased connection.
    pub fn sender(&self) -> SendRequest<Bytes> {
        self.connection.sender.clone()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }
}

impl Deref for StreamLease {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.connection.release();
    }
}

/// Drive the h2 client connection until it ends.
///
/// Returns a short reason used for logging.
pub(crate) async fn drive<T>(
    connection: Connection<T, Bytes>,
    pooled: Arc<PooledConnection>,
    idle_timeout: Option<Duration>,
    keepalive: Keepalive,
) -> &'static str
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = connection;
    let ping_pong = connection.ping_pong();
    tokio::pin!(connection);

    let reason = tokio::select! {
        result = &mut connection => match result {
            Ok(()) => "closed",
            Err(e) => {
                tracing::warn!(
                    connection_id = %pooled.id,
                    backend = %pooled.backend,
                    error = %e,
                    "Backend connection failed"
                );
                "error"
            }
        },
        err = keepalive::watch(ping_pong, keepalive) => {
            tracing::warn!(
                connection_id = %pooled.id,
                backend = %pooled.backend,
                error = %err,
                "Backend keepalive failed"
            );
            "keepalive"
        }
        _ = pooled.closing.cancelled() => "evicted",
        _ = pooled.idle_expired(idle_timeout) => "idle",
    };

    pooled.close();
    reason
}
