//! HTTP/2 PING keepalive.
//!
//! A peer that stops answering PINGs is treated as gone: the caller tears
//! the connection down, which fails every stream on it.

use std::time::Duration;

use h2::{Ping, PingPong};
use thiserror::Error;
use tokio::time::MissedTickBehavior;

/// Keepalive settings for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    /// `None` disables pings.
    pub interval: Option<Duration>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum KeepaliveError {
    #[error("no PONG within {0:?}")]
    Timeout(Duration),

    #[error("PING failed: {0}")]
    Ping(#[source] h2::Error),
}

/// Ping the peer forever, returning only once it stops answering.
///
/// Never resolves when keepalive is disabled or the connection has no
/// ping handle.
pub async fn watch(ping_pong: Option<PingPong>, keepalive: Keepalive) -> KeepaliveError {
    let (Some(mut ping_pong), Some(interval)) = (ping_pong, keepalive.interval) else {
        return std::future::pending().await;
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match tokio::time::timeout(keepalive.timeout, ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_pong)) => tracing::trace!("Keepalive PONG received"),
            Ok(Err(e)) => return KeepaliveError::Ping(e),
            Err(_) => return KeepaliveError::Timeout(keepalive.timeout),
        }
    }
}
