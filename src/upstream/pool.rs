//! Backend connection pool.
//!
//! # Responsibilities
//! - Keep outbound HTTP/2 connections keyed by backend (scheme + authority)
//! - Lease streams on existing connections before dialing new ones
//! - Cap connections per backend; queue on the least loaded one beyond that
//! - Drop connections that fail, idle out or are evicted
//!
//! # Design Decisions
//! - `DashMap` of per-backend slots; each slot has a dial mutex held across
//!   the dial, so concurrent first requests share one connection attempt
//! - The connection list has its own lock, never held across a dial, so
//!   streams that fit on an existing connection never wait for a dial
//! - Every connection has a driver task; the driver removes the connection
//!   from its slot when it ends

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Http2Config;
use crate::net::connection::{ConnectionId, IdSequence};
use crate::net::dialer::{DialError, Dialer};
use crate::net::keepalive::Keepalive;
use crate::observability::metrics;
use crate::routing::BackendKey;
use crate::upstream::connection::{self, PooledConnection, StreamLease};

/// Why no stream could be leased for a backend.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("HTTP/2 handshake with {backend} failed: {source}")]
    Handshake {
        backend: String,
        #[source]
        source: h2::Error,
    },

    #[error("backend pool is closed")]
    Closed,

    #[error("connection to {backend} closed before a stream could be leased")]
    Lost { backend: String },
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connections per backend before streams start queueing.
    pub max_connections: usize,
    pub max_streams_per_connection: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub keepalive: Keepalive,
    pub http2: Http2Config,
}

/// Pool counters for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Open backend connections.
    pub connections: usize,
    /// Connection attempts made since start.
    pub dials: u64,
}

#[derive(Debug, Default)]
struct Slot {
    connections: Mutex<Vec<Arc<PooledConnection>>>,
    /// Held for the length of a dial.
    dialing: Mutex<()>,
}

impl Slot {
    /// Lease on an open connection below its stream limit.
    async fn lease_existing(&self) -> Option<StreamLease> {
        let mut connections = self.connections.lock().await;
        connections.retain(|c| !c.is_closed());
        connections.iter().find_map(|c| c.try_acquire())
    }
}

/// Manages outbound connections for every backend.
#[derive(Debug)]
pub struct BackendPool {
    slots: DashMap<BackendKey, Arc<Slot>>,
    dialer: Dialer,
    settings: PoolSettings,
    ids: IdSequence,
    open: Arc<AtomicUsize>,
    dials: AtomicU64,
    closed: CancellationToken,
}

impl BackendPool {
    pub fn new(dialer: Dialer, settings: PoolSettings) -> Self {
        Self {
            slots: DashMap::new(),
            dialer,
            settings,
            ids: IdSequence::new(),
            open: Arc::new(AtomicUsize::new(0)),
            dials: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Lease a stream slot on a connection to `backend`, dialing if needed.
    pub async fn checkout(&self, backend: &BackendKey) -> Result<StreamLease, PoolError> {
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let slot: Arc<Slot> = self.slots.entry(backend.clone()).or_default().clone();
        if let Some(lease) = slot.lease_existing().await {
            return Ok(lease);
        }

        let _dialing = slot.dialing.lock().await;
        // A dial that finished while we waited may have room for us.
        if let Some(lease) = slot.lease_existing().await {
            return Ok(lease);
        }

        {
            let connections = slot.connections.lock().await;
            if connections.len() >= self.settings.max_connections {
                let queued = connections
                    .iter()
                    .min_by_key(|c| c.in_flight())
                    .and_then(|least_loaded| {
                        tracing::debug!(
                            backend = %backend,
                            connection_id = %least_loaded.id(),
                            in_flight = least_loaded.in_flight(),
                            "Backend connections saturated, queueing stream"
                        );
                        least_loaded.acquire_queued()
                    });
                if let Some(lease) = queued {
                    return Ok(lease);
                }
            }
        }

        let pooled = self.connect(backend, Arc::downgrade(&slot)).await?;
        let lease = pooled
            .try_acquire()
            .or_else(|| pooled.acquire_queued())
            .ok_or_else(|| PoolError::Lost {
                backend: backend.to_string(),
            })?;
        slot.connections.lock().await.push(pooled);
        Ok(lease)
    }

    async fn connect(
        &self,
        backend: &BackendKey,
        slot: Weak<Slot>,
    ) -> Result<Arc<PooledConnection>, PoolError> {
        self.dials.fetch_add(1, Ordering::Relaxed);

        let result = self.handshake(backend).await;
        metrics::record_backend_dial(result.is_ok());
        let (sender, h2_connection) = result?;

        let id = self.ids.next();
        let pooled = Arc::new(PooledConnection::new(
            id,
            backend.clone(),
            sender,
            self.settings.max_streams_per_connection,
            self.closed.child_token(),
        ));

        self.open.fetch_add(1, Ordering::Relaxed);
        metrics::record_pooled_connection_opened();
        tracing::info!(connection_id = %id, backend = %backend, "Backend connection established");

        let driven = Arc::clone(&pooled);
        let open = Arc::clone(&self.open);
        let idle_timeout = self.settings.idle_timeout;
        let keepalive = self.settings.keepalive;
        let span = tracing::debug_span!("backend_connection", connection_id = %id, backend = %backend);
        tokio::spawn(
            async move {
                let reason = connection::drive(h2_connection, Arc::clone(&driven), idle_timeout, keepalive).await;
                if let Some(slot) = slot.upgrade() {
                    slot.connections.lock().await.retain(|c| c.id() != driven.id());
                }
                open.fetch_sub(1, Ordering::Relaxed);
                metrics::record_pooled_connection_closed();
                tracing::debug!(reason, "Backend connection closed");
            }
            .instrument(span),
        );

        Ok(pooled)
    }

    async fn handshake(
        &self,
        backend: &BackendKey,
    ) -> Result<
        (
            h2::client::SendRequest<Bytes>,
            h2::client::Connection<crate::net::listener::BoxedIo, Bytes>,
        ),
        PoolError,
    > {
        let io = self.dialer.dial(backend).await?;
        self.settings
            .http2
            .client_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|source| {
                metrics::record_handshake_failure("outbound");
                PoolError::Handshake {
                    backend: backend.to_string(),
                    source,
                }
            })
    }

    /// Take a connection out of service, e.g. after it failed under a stream.
    pub async fn evict(&self, backend: &BackendKey, id: ConnectionId) {
        let Some(slot) = self.slots.get(backend).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut connections = slot.connections.lock().await;
        connections.retain(|c| {
            if c.id() == id {
                c.close();
                false
            } else {
                true
            }
        });
    }

    /// Close every connection and refuse further checkouts.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!(connections = self.open.load(Ordering::Relaxed), "Closing backend pool");
        }
        self.closed.cancel();
        self.slots.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self.open.load(Ordering::Relaxed),
            dials: self.dials.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::BackendScheme;
    use tokio::net::TcpListener;

    fn settings(max_connections: usize, cap: Option<usize>) -> PoolSettings {
        PoolSettings {
            max_connections,
            max_streams_per_connection: cap,
            idle_timeout: None,
            keepalive: Keepalive {
                interval: None,
                timeout: Duration::from_secs(1),
            },
            http2: Http2Config::default(),
        }
    }

    /// Plaintext h2 server that accepts streams and never answers them.
    async fn silent_backend() -> (BackendKey, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let (io, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = h2::server::handshake(io).await.unwrap();
                    let mut held = Vec::new();
                    while let Some(Ok(stream)) = conn.accept().await {
                        held.push(stream);
                    }
                });
            }
        });
        let key = BackendKey::new(BackendScheme::Http, &addr.to_string()).unwrap();
        (key, accepted)
    }

    fn pool(settings: PoolSettings) -> BackendPool {
        BackendPool::new(Dialer::new(Duration::from_secs(2), None, None), settings)
    }

    #[tokio::test]
    async fn concurrent_checkouts_share_one_dial() {
        let (backend, accepted) = silent_backend().await;
        let pool = Arc::new(pool(settings(4, None)));

        let mut leases = Vec::new();
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let backend = backend.clone();
                tokio::spawn(async move { pool.checkout(&backend).await.unwrap() })
            })
            .collect();
        for task in tasks {
            leases.push(task.await.unwrap());
        }

        assert_eq!(pool.stats().dials, 1);
        assert_eq!(pool.stats().connections, 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(leases.iter().all(|l| l.connection_id() == leases[0].connection_id()));
    }

    #[tokio::test]
    async fn cap_spills_to_new_connections_then_queues() {
        let (backend, _) = silent_backend().await;
        let pool = pool(settings(2, Some(1)));

        let a = pool.checkout(&backend).await.unwrap();
        let b = pool.checkout(&backend).await.unwrap();
        assert_ne!(a.connection_id(), b.connection_id());

        let c = pool.checkout(&backend).await.unwrap();
        assert_eq!(pool.stats().dials, 2);
        assert!(c.connection_id() == a.connection_id() || c.connection_id() == b.connection_id());
    }

    #[tokio::test]
    async fn evicted_connection_is_replaced() {
        let (backend, _) = silent_backend().await;
        let pool = pool(settings(1, None));

        let first = pool.checkout(&backend).await.unwrap();
        let first_id = first.connection_id();
        pool.evict(&backend, first_id).await;
        drop(first);

        let second = pool.checkout(&backend).await.unwrap();
        assert_ne!(second.connection_id(), first_id);
        assert_eq!(pool.stats().dials, 2);
    }

    #[tokio::test]
    async fn unreachable_backend_is_dial_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let backend = BackendKey::new(BackendScheme::Http, &format!("127.0.0.1:{port}")).unwrap();
        let pool = pool(settings(1, None));

        assert!(matches!(
            pool.checkout(&backend).await,
            Err(PoolError::Dial(DialError::Connect { .. }))
        ));
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkouts() {
        let (backend, _) = silent_backend().await;
        let pool = pool(settings(1, None));
        let lease = pool.checkout(&backend).await.unwrap();

        pool.close();
        assert!(lease.is_closed());
        assert!(matches!(pool.checkout(&backend).await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn pending_dial_does_not_block_free_connections() {
        let (backend, _) = silent_backend().await;
        let pool = pool(settings(2, None));
        drop(pool.checkout(&backend).await.unwrap());

        let slot = pool.slots.get(&backend).map(|s| Arc::clone(s.value())).unwrap();
        let _dialing = slot.dialing.lock().await;

        let lease = tokio::time::timeout(Duration::from_millis(500), pool.checkout(&backend))
            .await
            .expect("checkout waited on the dial lock")
            .unwrap();
        assert_eq!(lease.in_flight(), 1);
        assert_eq!(pool.stats().dials, 1);
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let (backend, _) = silent_backend().await;
        let mut settings = settings(1, None);
        settings.idle_timeout = Some(Duration::from_millis(100));
        let pool = pool(settings);

        drop(pool.checkout(&backend).await.unwrap());
        assert_eq!(pool.stats().connections, 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.stats().connections > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}
