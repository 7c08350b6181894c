//! Transport listener with backpressure.
//!
//! # Responsibilities
//! - Parse transport addresses (`vsock://`, `tcp://`, bare `host:port`)
//! - Bind a vsock or TCP listener behind one interface
//! - Enforce max_connections limit via semaphore
//! - Fail pending and future accepts with [`TransportError::Closed`] after close
//!
//! # Design Decisions
//! - Accepted connections are boxed as [`BoxedIo`]; nothing above this module
//!   knows which transport produced the bytes
//! - vsock is Linux-only; elsewhere binding a vsock address is
//!   [`TransportError::Unsupported`]
//! - Dropping the listener releases the OS socket, so new connection attempts
//!   are refused from that point on

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Wildcard CID: accept connections addressed to any local CID.
pub const VMADDR_CID_ANY: u32 = u32::MAX;
/// Well-known CID of the hypervisor host.
pub const VMADDR_CID_HOST: u32 = 2;

/// A duplex byte stream, whatever transport it came from.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection handed to the TLS layer.
pub type BoxedIo = Box<dyn Io>;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address string could not be parsed.
    #[error("invalid transport address `{address}`: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },

    /// vsock requested on a platform without it.
    #[error("vsock transport is not available on this platform")]
    Unsupported,

    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: TransportAddr,
        #[source]
        source: io::Error,
    },

    /// Failed to accept connection.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The listener was closed.
    #[error("listener closed")]
    Closed,
}

/// Address on one of the supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

impl TransportAddr {
    pub fn is_vsock(&self) -> bool {
        matches!(self, TransportAddr::Vsock { .. })
    }

    /// TCP socket address, if this is a TCP address.
    pub fn as_tcp(&self) -> Option<SocketAddr> {
        match self {
            TransportAddr::Tcp(addr) => Some(*addr),
            TransportAddr::Vsock { .. } => None,
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            TransportAddr::Vsock { cid, port } if *cid == VMADDR_CID_ANY => {
                write!(f, "vsock://any:{port}")
            }
            TransportAddr::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
        }
    }
}

impl FromStr for TransportAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| TransportError::InvalidAddress {
            address: s.to_string(),
            reason,
        };

        if let Some(rest) = s.strip_prefix("vsock://") {
            let (cid, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
            let cid = match cid {
                "any" | "" => VMADDR_CID_ANY,
                "host" => VMADDR_CID_HOST,
                n => n.parse().map_err(|_| invalid("cid is not a number"))?,
            };
            let port = port.parse().map_err(|_| invalid("port is not a number"))?;
            return Ok(TransportAddr::Vsock { cid, port });
        }

        let rest = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(invalid("unknown scheme, expected tcp:// or vsock://")),
            None => s,
        };
        rest.parse()
            .map(TransportAddr::Tcp)
            .map_err(|_| invalid("expected <ip>:<port>"))
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl Inner {
    async fn accept(&mut self) -> io::Result<(BoxedIo, TransportAddr)> {
        match self {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), TransportAddr::Tcp(peer)))
            }
            #[cfg(target_os = "linux")]
            Inner::Vsock(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((
                    Box::new(stream),
                    TransportAddr::Vsock {
                        cid: peer.cid(),
                        port: peer.port(),
                    },
                ))
            }
        }
    }
}

/// A bounded listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct TransportListener {
    inner: Inner,
    local_addr: TransportAddr,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    closed: CancellationToken,
}

impl TransportListener {
    /// Bind to a transport address with connection limits.
    pub async fn bind(
        address: &TransportAddr,
        max_connections: usize,
    ) -> Result<Self, TransportError> {
        let bind_err = |source| TransportError::Bind {
            address: *address,
            source,
        };

        let (inner, local_addr) = match *address {
            TransportAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local = listener.local_addr().map_err(bind_err)?;
                (Inner::Tcp(listener), TransportAddr::Tcp(local))
            }
            #[cfg(target_os = "linux")]
            TransportAddr::Vsock { cid, port } => {
                let listener =
                    tokio_vsock::VsockListener::bind(tokio_vsock::VsockAddr::new(cid, port))
                        .map_err(bind_err)?;
                let local = listener.local_addr().map_err(bind_err)?;
                (
                    Inner::Vsock(listener),
                    TransportAddr::Vsock {
                        cid: local.cid(),
                        port: local.port(),
                    },
                )
            }
            #[cfg(not(target_os = "linux"))]
            TransportAddr::Vsock { .. } => return Err(TransportError::Unsupported),
        };

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            closed: CancellationToken::new(),
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Waits while the limit is reached. Returns the stream, the peer address
    /// and a permit that must be held for the connection's lifetime.
    pub async fn accept(
        &mut self,
    ) -> Result<(BoxedIo, TransportAddr, ConnectionPermit), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                permit.map_err(|_| TransportError::Closed)?
            }
        };

        let (stream, peer) = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            accepted = self.inner.accept() => accepted.map_err(TransportError::Accept)?,
        };

        tracing::debug!(
            peer = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Fail pending and future accepts with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closer().close();
    }

    /// A handle that can close this listener from another task.
    pub fn closer(&self) -> ListenerCloser {
        ListenerCloser {
            closed: self.closed.clone(),
            connection_limit: Arc::clone(&self.connection_limit),
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> TransportAddr {
        self.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

/// Closes a [`TransportListener`] from anywhere.
#[derive(Debug, Clone)]
pub struct ListenerCloser {
    closed: CancellationToken,
    connection_limit: Arc<Semaphore>,
}

impl ListenerCloser {
    pub fn close(&self) {
        self.closed.cancel();
        self.connection_limit.close();
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
