//! Shared fixtures for the integration tests: a throwaway PKI, an HTTP/2
//! gRPC backend with switchable behaviour, and a gRPC client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::{Reason, RecvStream};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use vsock2http2::config::ProxyConfig;
use vsock2http2::net::tls::{ClientTrust, ServerIdentity, TlsServer};
use vsock2http2::{BackendScheme, Proxy, ProxyHandle};

pub const SERVER_NAME: &str = "localhost";

/// A CA plus one `localhost` leaf signed by it.
pub struct TestPki {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "vsock2http2 test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, SERVER_NAME);
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Self {
            ca_pem: ca.pem(),
            cert_pem: leaf.pem(),
            key_pem: leaf_key.serialize_pem(),
        }
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes()).unwrap()
    }

    pub fn trust(&self) -> ClientTrust {
        ClientTrust::from_ca_pem(self.ca_pem.as_bytes()).unwrap()
    }

    pub fn client_config(&self, alpn: &[&[u8]]) -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca_pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        config
    }
}

/// What the test backend does with each stream.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Echo the request body; trailers carry `grpc-status: 0` and any
    /// `trace-id` request header.
    Echo,
    /// Send headers and one DATA frame, then reset with the given reason.
    ResetAfterPartial(Reason),
    /// Send headers and one DATA frame, then drop the whole connection.
    DieMidStream,
    /// Send headers, then never read the request or finish the response.
    Hold,
    /// Read the request, then push DATA as fast as flow control allows.
    Flood,
}

/// Request headers as the backend saw them, in order.
pub type SeenHeaders = Vec<(String, String)>;

/// gRPC backend over TLS + HTTP/2 on an ephemeral TCP port.
pub struct TestBackend {
    pub addr: SocketAddr,
    /// TCP connections accepted.
    pub connections: Arc<AtomicUsize>,
    /// Streams reset by the peer (the proxy).
    pub peer_resets: Arc<AtomicUsize>,
    /// Response bytes handed to h2 by `Behavior::Flood`.
    pub pushed: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<SeenHeaders>>>,
}

impl TestBackend {
    pub async fn start(pki: &TestPki, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tls = Arc::new(TlsServer::new(&pki.identity(), Duration::from_secs(5)).unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let peer_resets = Arc::new(AtomicUsize::new(0));
        let pushed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let backend = Self {
            addr,
            connections: connections.clone(),
            peer_resets: peer_resets.clone(),
            pushed: pushed.clone(),
            seen: seen.clone(),
        };

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let tls = tls.clone();
                let peer_resets = peer_resets.clone();
                let pushed = pushed.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let Ok(stream) = tls.accept(Box::new(tcp)).await else {
                        return;
                    };
                    let Ok(mut conn) = h2::server::handshake(stream).await else {
                        return;
                    };
                    let kill = CancellationToken::new();
                    loop {
                        tokio::select! {
                            _ = kill.cancelled() => return,
                            next = conn.accept() => match next {
                                Some(Ok((request, respond))) => {
                                    seen.lock().unwrap().push(metadata(request.headers()));
                                    tokio::spawn(handle_stream(
                                        behavior,
                                        request,
                                        respond,
                                        kill.clone(),
                                        peer_resets.clone(),
                                        pushed.clone(),
                                    ));
                                }
                                _ => return,
                            },
                        }
                    }
                });
            }
        });

        backend
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn peer_reset_count(&self) -> usize {
        self.peer_resets.load(Ordering::SeqCst)
    }

    pub fn pushed_bytes(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }
}

/// TCP forwarder between the proxy and a backend that can be frozen: once
/// stalled it keeps every socket open but moves no more bytes.
pub struct StallingRelay {
    pub addr: SocketAddr,
    stall: CancellationToken,
}

impl StallingRelay {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stall = CancellationToken::new();

        let token = stall.clone();
        tokio::spawn(async move {
            while let Ok((inbound, _)) = listener.accept().await {
                let Ok(outbound) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let (in_read, in_write) = inbound.into_split();
                let (out_read, out_write) = outbound.into_split();
                tokio::spawn(pipe(in_read, out_write, token.clone()));
                tokio::spawn(pipe(out_read, in_write, token.clone()));
            }
        });

        Self { addr, stall }
    }

    pub fn stall(&self) {
        self.stall.cancel();
    }

    /// The same relay, dressed as a backend for `start_proxy`.
    pub fn as_backend(&self) -> TestBackend {
        TestBackend {
            addr: self.addr,
            connections: Default::default(),
            peer_resets: Default::default(),
            pushed: Default::default(),
            seen: Default::default(),
        }
    }
}

async fn pipe(mut from: OwnedReadHalf, mut to: OwnedWriteHalf, stall: CancellationToken) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = tokio::select! {
            _ = stall.cancelled() => break,
            read = from.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };
        if to.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
    std::future::pending::<()>().await;
    drop((from, to));
}

/// `x-` and `trace-` request headers, in wire order.
pub fn metadata(headers: &HeaderMap) -> SeenHeaders {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-") || name.as_str() == "trace-id")
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap().to_string()))
        .collect()
}

fn grpc_head() -> Response<()> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/grpc")
        .body(())
        .unwrap()
}

async fn handle_stream(
    behavior: Behavior,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    kill: CancellationToken,
    peer_resets: Arc<AtomicUsize>,
    pushed: Arc<AtomicUsize>,
) {
    let trace_id = request.headers().get("trace-id").cloned();
    let mut body = request.into_body();

    match behavior {
        Behavior::Echo => {
            let payload = read_all(&mut body).await;
            let Ok(mut send) = respond.send_response(grpc_head(), false) else {
                return;
            };
            if !payload.is_empty() {
                let _ = send.send_data(payload, false);
            }
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", "0".parse().unwrap());
            if let Some(trace_id) = trace_id {
                trailers.insert("trace-id", trace_id);
            }
            let _ = send.send_trailers(trailers);
        }
        Behavior::ResetAfterPartial(reason) => {
            let _ = read_all(&mut body).await;
            let Ok(mut send) = respond.send_response(grpc_head(), false) else {
                return;
            };
            let _ = send.send_data(grpc_frame(b"partial"), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            send.send_reset(reason);
        }
        Behavior::DieMidStream => {
            let _ = read_all(&mut body).await;
            let Ok(mut send) = respond.send_response(grpc_head(), false) else {
                return;
            };
            let _ = send.send_data(grpc_frame(b"partial"), false);
            tokio::time::sleep(Duration::from_millis(100)).await;
            kill.cancel();
        }
        Behavior::Hold => {
            let Ok(mut send) = respond.send_response(grpc_head(), false) else {
                return;
            };
            let reset = std::future::poll_fn(|cx| send.poll_reset(cx)).await;
            if reset.is_ok() {
                peer_resets.fetch_add(1, Ordering::SeqCst);
            }
            drop(body);
        }
        Behavior::Flood => {
            let _ = read_all(&mut body).await;
            let Ok(mut send) = respond.send_response(grpc_head(), false) else {
                return;
            };
            loop {
                send.reserve_capacity(16 * 1024);
                match std::future::poll_fn(|cx| send.poll_capacity(cx)).await {
                    Some(Ok(0)) => continue,
                    Some(Ok(n)) => {
                        if send.send_data(Bytes::from(vec![0u8; n]), false).is_err() {
                            return;
                        }
                        pushed.fetch_add(n, Ordering::SeqCst);
                    }
                    _ => return,
                }
            }
        }
    }
}

async fn read_all(body: &mut RecvStream) -> Bytes {
    let mut out = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let Ok(chunk) = chunk else { break };
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    out.freeze()
}

/// Length-prefixed gRPC message.
pub fn grpc_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// A gRPC POST to `path` with the given metadata, in order.
pub fn grpc_request(path: &str, metadata: &[(&str, &str)]) -> Request<()> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("https://{SERVER_NAME}{path}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    for (name, value) in metadata {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap()
}

/// Proxy listening on an ephemeral TCP port, relaying to `backend`.
pub async fn start_proxy(
    pki: &TestPki,
    backend: &TestBackend,
    tweak: impl FnOnce(&mut ProxyConfig),
) -> ProxyHandle {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "tcp://127.0.0.1:0".to_string();
    config.backend.address = backend.addr.to_string();
    config.backend.scheme = BackendScheme::Https;
    config.backend.server_name = Some(SERVER_NAME.to_string());
    config.shutdown.grace_period_ms = 500;
    tweak(&mut config);

    Proxy::new(config, pki.identity(), Some(pki.trust()))
        .start()
        .await
        .unwrap()
}

pub fn proxy_addr(handle: &ProxyHandle) -> SocketAddr {
    handle.local_addr().as_tcp().unwrap()
}

/// TLS handshake offering `alpn`.
pub async fn tls_connect(
    pki: &TestPki,
    addr: SocketAddr,
    alpn: &[&[u8]],
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let connector = TlsConnector::from(Arc::new(pki.client_config(alpn)));
    connector
        .connect(ServerName::try_from(SERVER_NAME).unwrap(), tcp)
        .await
}

/// HTTP/2 client connection to the proxy. The connection is driven in the
/// background.
pub async fn connect_client(pki: &TestPki, addr: SocketAddr) -> SendRequest<Bytes> {
    let tls = tls_connect(pki, addr, &[b"h2"]).await.unwrap();
    let (client, conn) = h2::client::handshake(tls).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    client
}

/// Like `connect_client`, with a fixed receive window for each stream and
/// for the connection.
pub async fn connect_client_with_window(
    pki: &TestPki,
    addr: SocketAddr,
    window: u32,
) -> SendRequest<Bytes> {
    let tls = tls_connect(pki, addr, &[b"h2"]).await.unwrap();
    let (client, conn) = h2::client::Builder::new()
        .initial_window_size(window)
        .initial_connection_window_size(window)
        .handshake::<_, Bytes>(tls)
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    client
}

/// A finished gRPC call as the client saw it.
#[derive(Debug)]
pub struct GrpcReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

impl GrpcReply {
    /// `grpc-status` from the trailers, or from the headers of a
    /// trailers-only response.
    pub fn grpc_status(&self) -> Option<u32> {
        self.trailers
            .as_ref()
            .and_then(|t| t.get("grpc-status"))
            .or_else(|| self.headers.get("grpc-status"))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// Send one request with `payload` as the whole body and collect the reply.
pub async fn unary(
    client: &mut SendRequest<Bytes>,
    request: Request<()>,
    payload: Bytes,
) -> Result<GrpcReply, h2::Error> {
    let mut client = client.clone().ready().await?;
    let (response, mut send) = client.send_request(request, false)?;
    send.send_data(payload, true)?;

    let response = response.await?;
    let (head, mut body) = response.into_parts();
    let mut out = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    let trailers = body.trailers().await?;

    Ok(GrpcReply {
        status: head.status,
        headers: head.headers,
        body: out.freeze(),
        trailers,
    })
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
