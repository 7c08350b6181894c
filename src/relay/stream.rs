//! Relay of one inbound stream to its outbound pair.
//!
//! # Data Flow
//! ```text
//! inbound HEADERS
//!     → Director::route (RoutingError → trailers-only UNIMPLEMENTED)
//!     → rewrite_request
//!     → BackendPool::checkout (failure → trailers-only UNAVAILABLE)
//!     → send_request upstream
//!     → request leg  (caller DATA/trailers → backend)  ┐ concurrently
//!     → response leg (backend HEADERS/DATA/trailers → caller) ┘
//! ```
//!
//! # Design Decisions
//! - The pairing ends when the response leg ends; an unfinished request
//!   body is then abandoned
//! - Backend RST_STREAM is mirrored to the caller with the same reason
//! - Caller reset or disconnect resets the backend stream with CANCEL
//! - Dropping the last handle of an open h2 stream also resets it, so
//!   abandoned legs never leak backend streams

use std::future::poll_fn;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use h2::client::ResponseFuture;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::{Request, Response};
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::relay::body::{forward_body, BodyError};
use crate::relay::pairing::{PairingState, StreamPhase};
use crate::relay::status::{self, Code};
use crate::relay::{RelayContext, RelayError};
use crate::routing::rewrite::{copy_end_to_end, rewrite_request};
use crate::upstream::StreamLease;

/// Relay one inbound stream until both directions are terminal.
///
/// Every exit leaves the caller with a terminal signal: the backend's own
/// status, a synthesized gRPC status, or a reset.
pub async fn relay_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    ctx: Arc<RelayContext>,
    state: Arc<PairingState>,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let started = Instant::now();
    ctx.active_streams.fetch_add(1, Ordering::Relaxed);
    metrics::record_stream_started();

    let result = relay(request, &mut respond, &ctx, &state, &cancel).await;

    state.set_phase(StreamPhase::Closed);
    ctx.active_streams.fetch_sub(1, Ordering::Relaxed);
    let outcome = match &result {
        Ok(()) => "ok",
        Err(e) => e.outcome(),
    };
    metrics::record_stream_finished(outcome, started);
    result
}

async fn relay(
    request: Request<RecvStream>,
    respond: &mut SendResponse<Bytes>,
    ctx: &RelayContext,
    state: &Arc<PairingState>,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    state.set_phase(StreamPhase::HeadersReceived);
    let (head, inbound) = request.into_parts();

    let routed = ctx
        .director
        .route(&head)
        .and_then(|decision| rewrite_request(head, &decision).map(|req| (decision, req)));
    let (decision, upstream_request) = match routed {
        Ok(routed) => routed,
        Err(e) => {
            tracing::debug!(pairing = %state.key(), error = %e, "Routing failed");
            reply_status(respond, Code::Unimplemented, &e.to_string());
            return Err(e.into());
        }
    };

    let lease = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(reset_for_shutdown(respond)),
        reset = poll_fn(|cx| respond.poll_reset(cx)) => return Err(client_reset(reset)),
        lease = ctx.pool.checkout(&decision.backend) => lease,
    };
    let lease = match lease {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(pairing = %state.key(), backend = %decision.backend, error = %e, "Backend unavailable");
            reply_status(respond, Code::Unavailable, "backend unavailable");
            return Err(RelayError::unavailable(e));
        }
    };

    let result = relay_on(&lease, upstream_request, inbound, respond, state, cancel).await;
    if let Err(e) = &result {
        if e.is_connection_failure() {
            ctx.pool.evict(&decision.backend, lease.connection_id()).await;
        }
    }
    result
}

/// Relay once a backend stream slot is leased.
async fn relay_on(
    lease: &StreamLease,
    upstream_request: Request<()>,
    inbound: RecvStream,
    respond: &mut SendResponse<Bytes>,
    state: &PairingState,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    let sender = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(reset_for_shutdown(respond)),
        reset = poll_fn(|cx| respond.poll_reset(cx)) => return Err(client_reset(reset)),
        ready = lease.sender().ready() => ready,
    };

    let end_of_request = inbound.is_end_stream();
    let sent = sender.and_then(|mut sender| sender.send_request(upstream_request, end_of_request));
    let (response, upstream_tx) = match sent {
        Ok(sent) => sent,
        Err(e) => {
            tracing::warn!(pairing = %state.key(), connection_id = %lease.connection_id(), error = %e, "Backend refused stream");
            reply_status(respond, Code::Unavailable, "backend unavailable");
            return Err(RelayError::unavailable(e));
        }
    };

    state.set_upstream_stream(upstream_tx.stream_id().as_u32());
    state.set_phase(StreamPhase::BodyStreaming);
    tracing::debug!(
        pairing = %state.key(),
        connection_id = %lease.connection_id(),
        upstream_stream = upstream_tx.stream_id().as_u32(),
        "Stream paired"
    );
    if end_of_request {
        state.request_finished();
    }

    let verdict = {
        let abort = CancellationToken::new();
        let request_leg = relay_request(inbound, upstream_tx, end_of_request, abort.clone());
        let response_leg = relay_response(respond, response, state);
        tokio::pin!(request_leg, response_leg);
        let mut request_done = end_of_request;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Verdict::Shutdown,
                end = &mut request_leg, if !request_done => {
                    request_done = true;
                    match end {
                        RequestEnd::Finished => state.request_finished(),
                        RequestEnd::ClientGone(e) => break Verdict::ClientGone(e),
                        // The response leg observes the same failure and reports it.
                        RequestEnd::UpstreamFailed(e) => {
                            tracing::debug!(pairing = %state.key(), error = %e, "Request leg ended by backend");
                        }
                        RequestEnd::Aborted => {}
                    }
                }
                end = &mut response_leg => {
                    if end.is_err() && !request_done {
                        // Let the request leg reset the backend stream explicitly.
                        abort.cancel();
                        let _ = (&mut request_leg).await;
                    }
                    break Verdict::Response(end);
                }
            }
        }
    };

    match verdict {
        Verdict::Response(result) => result,
        Verdict::ClientGone(e) => Err(RelayError::ClientDisconnected(e)),
        Verdict::Shutdown => Err(reset_for_shutdown(respond)),
    }
}

enum Verdict {
    Response(Result<(), RelayError>),
    ClientGone(Option<h2::Error>),
    Shutdown,
}

enum RequestEnd {
    Finished,
    ClientGone(Option<h2::Error>),
    UpstreamFailed(BodyError),
    Aborted,
}

/// Caller → backend direction. Owns both request-side handles.
async fn relay_request(
    mut inbound: RecvStream,
    mut upstream_tx: SendStream<Bytes>,
    already_ended: bool,
    abort: CancellationToken,
) -> RequestEnd {
    if already_ended {
        return RequestEnd::Finished;
    }

    let result = tokio::select! {
        biased;
        _ = abort.cancelled() => {
            upstream_tx.send_reset(Reason::CANCEL);
            return RequestEnd::Aborted;
        }
        result = forward_body(&mut inbound, &mut upstream_tx) => result,
    };

    match result {
        Ok(()) => RequestEnd::Finished,
        Err(BodyError::Source(e)) => {
            upstream_tx.send_reset(Reason::CANCEL);
            RequestEnd::ClientGone(Some(e))
        }
        Err(e) => RequestEnd::UpstreamFailed(e),
    }
}

/// Backend → caller direction.
async fn relay_response(
    respond: &mut SendResponse<Bytes>,
    response: ResponseFuture,
    state: &PairingState,
) -> Result<(), RelayError> {
    let response = tokio::select! {
        biased;
        reset = poll_fn(|cx| respond.poll_reset(cx)) => return Err(client_reset(reset)),
        response = response => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => return Err(upstream_failed(respond, None, e, state)),
    };

    let (head, mut body) = response.into_parts();
    let mut downstream_head = Response::new(());
    *downstream_head.status_mut() = head.status;
    copy_end_to_end(head.headers, downstream_head.headers_mut());

    let end_of_stream = body.is_end_stream();
    let mut downstream = respond
        .send_response(downstream_head, end_of_stream)
        .map_err(|e| RelayError::ClientDisconnected(Some(e)))?;
    if end_of_stream {
        state.response_finished();
        return Ok(());
    }

    match forward_body(&mut body, &mut downstream).await {
        Ok(()) => {
            state.response_finished();
            Ok(())
        }
        Err(BodyError::Source(e)) => Err(upstream_failed(respond, Some(&mut downstream), e, state)),
        Err(BodyError::Sink(e)) => Err(RelayError::ClientDisconnected(Some(e))),
        Err(BodyError::SinkReset(_) | BodyError::SinkClosed) => {
            Err(RelayError::ClientDisconnected(None))
        }
    }
}

/// Surface a backend failure to the caller.
///
/// A backend reset is mirrored with the same reason. Anything else becomes
/// gRPC `UNAVAILABLE`: as trailers when response headers already went out,
/// as a trailers-only response otherwise.
fn upstream_failed(
    respond: &mut SendResponse<Bytes>,
    downstream: Option<&mut SendStream<Bytes>>,
    error: h2::Error,
    state: &PairingState,
) -> RelayError {
    if error.is_reset() && error.is_remote() {
        let reason = error.reason().unwrap_or(Reason::INTERNAL_ERROR);
        tracing::debug!(pairing = %state.key(), ?reason, "Backend reset stream");
        respond.send_reset(reason);
        return RelayError::UpstreamReset(reason);
    }

    tracing::warn!(pairing = %state.key(), error = %error, "Backend stream failed");
    match downstream {
        Some(downstream) => {
            let trailers = status::status_trailers(Code::Unavailable, "backend connection lost");
            if downstream.send_trailers(trailers).is_err() {
                respond.send_reset(Reason::CANCEL);
            }
        }
        None => reply_status(respond, Code::Unavailable, "backend connection lost"),
    }
    RelayError::unavailable(error)
}

/// End the stream with a trailers-only gRPC status.
fn reply_status(respond: &mut SendResponse<Bytes>, code: Code, message: &str) {
    if let Err(e) = respond.send_response(status::trailers_only(code, message), true) {
        tracing::debug!(error = %e, "Could not send status to client");
    }
}

fn reset_for_shutdown(respond: &mut SendResponse<Bytes>) -> RelayError {
    respond.send_reset(Reason::CANCEL);
    RelayError::Shutdown
}

fn client_reset(reset: Result<Reason, h2::Error>) -> RelayError {
    match reset {
        Ok(reason) => {
            tracing::debug!(?reason, "Client reset stream");
            RelayError::ClientDisconnected(None)
        }
        Err(e) => RelayError::ClientDisconnected(Some(e)),
    }
}
