//! End-to-end relay tests: client → proxy → gRPC backend over TLS + HTTP/2.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::request::Parts;
use http::StatusCode;
use vsock2http2::{BackendKey, BackendScheme, Director, RouteDecision, RoutingError};

mod common;

use common::{
    connect_client, connect_client_with_window, grpc_frame, grpc_request, proxy_addr,
    start_proxy, unary, Behavior, TestBackend, TestPki,
};

#[tokio::test]
async fn unary_call_is_relayed_unchanged() {
    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Echo).await;
    let proxy = start_proxy(&pki, &backend, |_| {}).await;
    let mut client = connect_client(&pki, proxy_addr(&proxy)).await;

    let payload = grpc_frame(b"hello backend");
    let reply = unary(
        &mut client,
        grpc_request("/echo.Echo/Say", &[]),
        payload.clone(),
    )
    .await
    .unwrap();

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, payload);
    assert_eq!(reply.grpc_status(), Some(0));
    assert_eq!(
        reply.headers.get("content-type").unwrap(),
        "application/grpc"
    );

    proxy.stop().await;
}

#[tokio::test]
async fn metadata_reaches_backend_in_per_name_order() {
    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Echo).await;
    let proxy = start_proxy(&pki, &backend, |_| {}).await;
    let mut client = connect_client(&pki, proxy_addr(&proxy)).await;

    let request = grpc_request(
        "/echo.Echo/Say",
        &[("x-tenant", "blue"), ("x-attempt", "1"), ("x-tenant", "green")],
    );
    // `HeaderMap` groups repeated names, so only the order of values under
    // one name is observable here.
    let sent = common::metadata(request.headers());
    unary(&mut client, request, grpc_frame(b"m")).await.unwrap();

    let seen = backend.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], sent);
    let tenants: Vec<_> = seen[0]
        .iter()
        .filter(|(name, _)| name == "x-tenant")
        .map(|(_, value)| value.as_str())
        .collect();
    assert_eq!(tenants, ["blue", "green"]);

    proxy.stop().await;
}

#[tokio::test]
async fn backend_trailers_reach_client() {
    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Echo).await;
    let proxy = start_proxy(&pki, &backend, |_| {}).await;
    let mut client = connect_client(&pki, proxy_addr(&proxy)).await;

    let reply = unary(
        &mut client,
        grpc_request("/echo.Echo/Say", &[("trace-id", "abc")]),
        grpc_frame(b"traced"),
    )
    .await
    .unwrap();

    let trailers = reply.trailers.as_ref().unwrap();
    assert_eq!(trailers.get("trace-id").unwrap(), "abc");
    assert_eq!(reply.grpc_status(), Some(0));

    proxy.stop().await;
}

#[tokio::test]
async fn concurrent_streams_share_one_backend_connection() {
    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Echo).await;
    let proxy = start_proxy(&pki, &backend, |_| {}).await;
    let client = connect_client(&pki, proxy_addr(&proxy)).await;

    let mut calls = Vec::new();
    for i in 0..10 {
        let mut client = client.clone();
        calls.push(tokio::spawn(async move {
            let payload = grpc_frame(format!("stream {i}").as_bytes());
            let reply = unary(
                &mut client,
                grpc_request("/echo.Echo/Say", &[]),
                payload.clone(),
            )
            .await
            .unwrap();
            (payload, reply)
        }));
    }

    for call in calls {
        let (payload, reply) = call.await.unwrap();
        assert_eq!(reply.body, payload);
        assert_eq!(reply.grpc_status(), Some(0));
    }
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(proxy.stats().backend_dials, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn identical_calls_on_separate_connections_match() {
    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Echo).await;
    let proxy = start_proxy(&pki, &backend, |_| {}).await;

    let mut replies = Vec::new();
    for _ in 0..2 {
        let mut client = connect_client(&pki, proxy_addr(&proxy)).await;
        let reply = unary(
            &mut client,
            grpc_request("/echo.Echo/Say", &[("trace-id", "same")]),
            grpc_frame(b"idempotent"),
        )
        .await
        .unwrap();
        replies.push(reply);
    }

    assert_eq!(replies[0].status, replies[1].status);
    assert_eq!(replies[0].body, replies[1].body);
    assert_eq!(replies[0].trailers, replies[1].trailers);

    proxy.stop().await;
}

#[derive(Debug)]
struct PrefixDirector {
    allowed: &'static str,
    backend: BackendKey,
}

impl Director for PrefixDirector {
    fn route(&self, head: &Parts) -> Result<RouteDecision, RoutingError> {
        if head.uri.path().starts_with(self.allowed) {
            Ok(RouteDecision {
                backend: self.backend.clone(),
            })
        } else {
            Err(RoutingError::MalformedPath(head.uri.path().to_string()))
        }
    }
}

#[tokio::test]
async fn unroutable_stream_gets_unimplemented_and_siblings_continue() {
    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Echo).await;

    let mut config = vsock2http2::ProxyConfig::default();
    config.listener.bind_address = "tcp://127.0.0.1:0".to_string();
    config.backend.server_name = Some(common::SERVER_NAME.to_string());
    let director = PrefixDirector {
        allowed: "/echo.",
        backend: BackendKey::new(BackendScheme::Https, &backend.addr.to_string()).unwrap(),
    };
    let proxy = vsock2http2::Proxy::new(config, pki.identity(), Some(pki.trust()))
        .with_director(Arc::new(director))
        .start()
        .await
        .unwrap();
    let mut client = connect_client(&pki, proxy_addr(&proxy)).await;

    let rejected = unary(
        &mut client,
        grpc_request("/other.Service/Call", &[]),
        grpc_frame(b"nope"),
    )
    .await
    .unwrap();
    assert_eq!(rejected.status, StatusCode::OK);
    assert_eq!(rejected.grpc_status(), Some(12));
    assert!(rejected.body.is_empty());
    assert!(rejected.trailers.is_none());

    let accepted = unary(
        &mut client,
        grpc_request("/echo.Echo/Say", &[]),
        grpc_frame(b"yes"),
    )
    .await
    .unwrap();
    assert_eq!(accepted.grpc_status(), Some(0));
    assert_eq!(accepted.body, grpc_frame(b"yes"));

    tokio::time::timeout(Duration::from_secs(5), proxy.stop())
        .await
        .unwrap();
}

#[tokio::test]
async fn plaintext_backend_scheme_is_supported() {
    let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = backend.accept().await {
            tokio::spawn(async move {
                let mut conn = h2::server::handshake(tcp).await.unwrap();
                while let Some(Ok((_request, mut respond))) = conn.accept().await {
                    let head = http::Response::builder()
                        .header("content-type", "application/grpc")
                        .header("grpc-status", "0")
                        .body(())
                        .unwrap();
                    let _ = respond.send_response(head, true);
                }
            });
        }
    });

    let pki = TestPki::generate();
    let mut config = vsock2http2::ProxyConfig::default();
    config.listener.bind_address = "tcp://127.0.0.1:0".to_string();
    config.backend.address = backend_addr.to_string();
    config.backend.scheme = BackendScheme::Http;
    let proxy = vsock2http2::Proxy::new(config, pki.identity(), None)
        .start()
        .await
        .unwrap();
    let mut client = connect_client(&pki, proxy_addr(&proxy)).await;

    let reply = unary(
        &mut client,
        grpc_request("/echo.Echo/Say", &[]),
        Bytes::new(),
    )
    .await
    .unwrap();
    assert_eq!(reply.grpc_status(), Some(0));

    proxy.stop().await;
}

#[tokio::test]
async fn slow_client_bounds_backend() {
    const WINDOW: u32 = 64 * 1024;

    let pki = TestPki::generate();
    let backend = TestBackend::start(&pki, Behavior::Flood).await;
    let proxy = start_proxy(&pki, &backend, |c| {
        c.http2.initial_stream_window = WINDOW;
        c.http2.initial_connection_window = 4 * WINDOW;
    })
    .await;
    let client = connect_client_with_window(&pki, proxy_addr(&proxy), WINDOW).await;

    let mut client = client.ready().await.unwrap();
    let (response, mut send) = client
        .send_request(grpc_request("/echo.Echo/Download", &[]), false)
        .unwrap();
    send.send_data(grpc_frame(b"go"), true).unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), response)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The body is never read, so the client never releases its window.
    let _body = response.into_body();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Client window plus the proxy's outbound window towards the backend.
    let pushed = backend.pushed_bytes();
    assert!(pushed > 0);
    assert!(pushed <= 4 * WINDOW as usize, "backend pushed {pushed} bytes");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.pushed_bytes(), pushed);

    proxy.stop().await;
}
