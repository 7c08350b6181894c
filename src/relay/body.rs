//! Body forwarding between two HTTP/2 streams with per-leg flow control.
//!
//! Chunks are forwarded as they arrive, never buffered whole. Receive
//! capacity on the source is released only after the chunk has been handed
//! to the sink with granted send capacity, so a slow sink stalls the source
//! through its own flow-control window.

use std::future::poll_fn;

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use thiserror::Error;

/// Why a body could not be forwarded completely.
#[derive(Debug, Error)]
pub enum BodyError {
    /// Reading from the source stream failed (reset, connection loss).
    #[error("source stream failed: {0}")]
    Source(#[source] h2::Error),

    /// Writing to the sink stream failed.
    #[error("sink stream failed: {0}")]
    Sink(#[source] h2::Error),

    /// The sink peer reset the stream.
    #[error("sink stream reset: {0}")]
    SinkReset(Reason),

    /// The sink can no longer accept data.
    #[error("sink stream closed")]
    SinkClosed,
}

/// Forward DATA and trailers from `src` to `dst` until the source ends.
///
/// Ends `dst` exactly once: with the trailers if the source has any,
/// otherwise with END_STREAM on the last DATA frame.
pub async fn forward_body(src: &mut RecvStream, dst: &mut SendStream<Bytes>) -> Result<(), BodyError> {
    loop {
        let next = tokio::select! {
            biased;
            reset = poll_fn(|cx| dst.poll_reset(cx)) => return Err(sink_reset(reset)),
            next = src.data() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let len = chunk.len();
                let end_of_stream = src.is_end_stream();
                send_chunk(dst, chunk, end_of_stream).await?;
                if let Err(e) = src.flow_control().release_capacity(len) {
                    tracing::trace!(error = %e, "Could not release receive capacity");
                }
                if end_of_stream {
                    return Ok(());
                }
            }
            Some(Err(e)) => return Err(BodyError::Source(e)),
            None => break,
        }
    }

    let trailers = tokio::select! {
        biased;
        reset = poll_fn(|cx| dst.poll_reset(cx)) => return Err(sink_reset(reset)),
        trailers = src.trailers() => trailers.map_err(BodyError::Source)?,
    };

    match trailers {
        Some(trailers) => dst.send_trailers(trailers).map_err(BodyError::Sink),
        None => dst.send_data(Bytes::new(), true).map_err(BodyError::Sink),
    }
}

fn sink_reset(reset: Result<Reason, h2::Error>) -> BodyError {
    match reset {
        Ok(reason) => BodyError::SinkReset(reason),
        Err(e) => BodyError::Sink(e),
    }
}

/// Send one chunk, splitting it to the send capacity the peer grants.
async fn send_chunk(dst: &mut SendStream<Bytes>, mut chunk: Bytes, end_of_stream: bool) -> Result<(), BodyError> {
    if chunk.is_empty() {
        if end_of_stream {
            dst.send_data(chunk, true).map_err(BodyError::Sink)?;
        }
        return Ok(());
    }

    while !chunk.is_empty() {
        dst.reserve_capacity(chunk.len());
        let granted = match dst.capacity() {
            0 => wait_for_capacity(dst).await?,
            n => n,
        };
        let piece = chunk.split_to(granted.min(chunk.len()));
        dst.send_data(piece, end_of_stream && chunk.is_empty())
            .map_err(BodyError::Sink)?;
    }
    Ok(())
}

async fn wait_for_capacity(dst: &mut SendStream<Bytes>) -> Result<usize, BodyError> {
    loop {
        match poll_fn(|cx| dst.poll_capacity(cx)).await {
            Some(Ok(0)) => continue,
            Some(Ok(n)) => return Ok(n),
            Some(Err(e)) => return Err(BodyError::Sink(e)),
            None => return Err(BodyError::SinkClosed),
        }
    }
}
