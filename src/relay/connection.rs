//! Inbound connection serving.
//!
//! # Responsibilities
//! - TLS accept and HTTP/2 server handshake under one deadline
//! - Accept streams and relay each one, multiplexed inside this task
//! - Graceful shutdown: GOAWAY, grace period, then forced reset of stragglers
//! - PING keepalive towards the caller
//!
//! # Design Decisions
//! - One task per connection; streams are futures in a `FuturesUnordered`
//!   polled alongside the h2 connection
//! - The h2 connection keeps being polled until it closes so that resets
//!   and GOAWAY frames reach the caller

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use h2::Reason;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::net::connection::ConnectionId;
use crate::net::keepalive;
use crate::net::listener::{BoxedIo, TransportAddr};
use crate::net::tls::HandshakeError;
use crate::observability::metrics;
use crate::relay::pairing::{PairingTable, StreamPhase};
use crate::relay::stream::relay_stream;
use crate::relay::{RelayContext, RelayError};

/// Serve one inbound connection until it closes.
///
/// Handshake failures are returned; everything after the handshake is
/// handled per stream and logged.
pub async fn serve_connection(
    io: BoxedIo,
    peer: TransportAddr,
    id: ConnectionId,
    ctx: Arc<RelayContext>,
    shutdown: CancellationToken,
) -> Result<(), HandshakeError> {
    let handshake = async {
        let tls = ctx.tls.accept(io).await?;
        tokio::time::timeout(
            ctx.handshake_timeout,
            ctx.http2.server_builder().handshake::<_, Bytes>(tls),
        )
        .await
        .map_err(|_| HandshakeError::Timeout(ctx.handshake_timeout))?
        .map_err(HandshakeError::Http2)
    };

    let mut conn = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(HandshakeError::Aborted),
        conn = handshake => match conn {
            Ok(conn) => conn,
            Err(e) => {
                metrics::record_handshake_failure("inbound");
                return Err(e);
            }
        },
    };
    tracing::debug!(peer = %peer, "HTTP/2 connection established");

    let keepalive = keepalive::watch(conn.ping_pong(), ctx.keepalive);
    tokio::pin!(keepalive);
    let grace = tokio::time::sleep_until(Instant::now());
    tokio::pin!(grace);

    let mut table = PairingTable::new(id);
    let mut streams = FuturesUnordered::new();
    let mut accepting = true;
    let mut draining = false;
    let mut forced = false;
    let mut keepalive_failed = false;

    while accepting || !streams.is_empty() {
        tokio::select! {
            biased;
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                tracing::debug!(
                    in_flight = table.len(),
                    streaming = table.count_in(StreamPhase::BodyStreaming),
                    "Draining connection"
                );
                conn.graceful_shutdown();
                grace.as_mut().reset(Instant::now() + ctx.grace_period);
            }
            _ = &mut grace, if draining && !forced => {
                forced = true;
                let reset = table.cancel_all();
                if reset > 0 {
                    tracing::info!(streams = reset, "Grace period expired, resetting streams");
                }
            }
            err = &mut keepalive, if !keepalive_failed => {
                keepalive_failed = true;
                tracing::warn!(error = %err, "Client keepalive failed, closing connection");
                conn.abrupt_shutdown(Reason::NO_ERROR);
            }
            accepted = conn.accept(), if accepting => match accepted {
                Some(Ok((request, respond))) => {
                    let stream_id = respond.stream_id().as_u32();
                    let (state, cancel) = table.insert(stream_id);
                    if forced {
                        cancel.cancel();
                    }
                    tracing::trace!(stream_id, path = %request.uri().path(), "Stream accepted");
                    streams.push(
                        relay_stream(request, respond, Arc::clone(&ctx), state, cancel)
                            .map(move |result| (stream_id, result)),
                    );
                }
                Some(Err(e)) => {
                    accepting = false;
                    if e.is_io() {
                        tracing::debug!(error = %e, "Client connection lost");
                    } else {
                        tracing::warn!(error = %e, "Client connection error");
                    }
                }
                None => accepting = false,
            },
            Some((stream_id, result)) = streams.next(), if !streams.is_empty() => {
                let entry = table.remove(stream_id);
                let elapsed = entry.map(|e| e.opened.elapsed()).unwrap_or_default();
                log_stream_result(stream_id, &result, elapsed);
            }
        }
    }

    tracing::debug!("Connection closed");
    Ok(())
}

fn log_stream_result(stream_id: u32, result: &Result<(), RelayError>, elapsed: Duration) {
    match result {
        Ok(()) => tracing::debug!(stream_id, ?elapsed, "Stream completed"),
        Err(e @ (RelayError::ClientDisconnected(_) | RelayError::Shutdown)) => {
            tracing::debug!(stream_id, ?elapsed, outcome = e.outcome(), "Stream ended early")
        }
        Err(e) => tracing::info!(stream_id, ?elapsed, error = %e, "Stream failed"),
    }
}
