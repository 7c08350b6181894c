//! Inbound/outbound stream pairing.
//!
//! # Responsibilities
//! - Record the phase of every paired stream
//! - Own the per-stream cancellation used for forced shutdown
//!
//! # Design Decisions
//! - The connection loop owns one [`PairingTable`] keyed by inbound stream id;
//!   together with the table's connection id that is the pairing key
//! - Neither stream handle points at its peer; the relay task holds both
//! - Phases use the server-side view: *remote* is the caller, *local* is us

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::net::connection::ConnectionId;

/// Phase of a paired stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPhase {
    Idle = 0,
    /// Request head arrived; routing and outbound stream setup in progress.
    HeadersReceived = 1,
    /// Both directions open and relaying.
    BodyStreaming = 2,
    /// Response finished towards the caller; request body still flowing.
    HalfClosedLocal = 3,
    /// Caller finished its request body; response still flowing.
    HalfClosedRemote = 4,
    Closed = 5,
}

impl From<u8> for StreamPhase {
    fn from(val: u8) -> Self {
        match val {
            1 => StreamPhase::HeadersReceived,
            2 => StreamPhase::BodyStreaming,
            3 => StreamPhase::HalfClosedLocal,
            4 => StreamPhase::HalfClosedRemote,
            5 => StreamPhase::Closed,
            _ => StreamPhase::Idle,
        }
    }
}

/// Identifies a pairing: inbound connection plus inbound stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingKey {
    pub connection: ConnectionId,
    pub stream: u32,
}

impl fmt::Display for PairingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.stream)
    }
}

/// Shared view of one pairing, updated by its relay task.
#[derive(Debug)]
pub struct PairingState {
    key: PairingKey,
    phase: AtomicU8,
    /// Outbound stream id; 0 until the request is sent upstream.
    upstream_stream: AtomicU32,
}

impl PairingState {
    fn new(key: PairingKey) -> Self {
        Self {
            key,
            phase: AtomicU8::new(StreamPhase::Idle as u8),
            upstream_stream: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> PairingKey {
        self.key
    }

    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: StreamPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn upstream_stream(&self) -> Option<u32> {
        match self.upstream_stream.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_upstream_stream(&self, id: u32) {
        self.upstream_stream.store(id, Ordering::Release);
    }

    /// The caller's request body has been fully forwarded.
    pub fn request_finished(&self) {
        self.half_close(StreamPhase::HalfClosedRemote, StreamPhase::HalfClosedLocal);
    }

    /// The response has been fully forwarded to the caller.
    pub fn response_finished(&self) {
        self.half_close(StreamPhase::HalfClosedLocal, StreamPhase::HalfClosedRemote);
    }

    fn half_close(&self, this_side: StreamPhase, other_side: StreamPhase) {
        let next = match self.phase() {
            p if p == other_side => StreamPhase::Closed,
            StreamPhase::Closed => StreamPhase::Closed,
            _ => this_side,
        };
        self.set_phase(next);
    }
}

/// A table entry: the pairing's state and its forced-reset trigger.
#[derive(Debug)]
pub struct PairingEntry {
    pub state: Arc<PairingState>,
    pub cancel: CancellationToken,
    pub opened: Instant,
}

/// All live pairings of one inbound connection.
#[derive(Debug)]
pub struct PairingTable {
    connection: ConnectionId,
    entries: HashMap<u32, PairingEntry>,
}

impl PairingTable {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            entries: HashMap::new(),
        }
    }

    /// Register a new inbound stream.
    pub fn insert(&mut self, stream: u32) -> (Arc<PairingState>, CancellationToken) {
        let state = Arc::new(PairingState::new(PairingKey {
            connection: self.connection,
            stream,
        }));
        let cancel = CancellationToken::new();
        self.entries.insert(
            stream,
            PairingEntry {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
                opened: Instant::now(),
            },
        );
        (state, cancel)
    }

    pub fn remove(&mut self, stream: u32) -> Option<PairingEntry> {
        self.entries.remove(&stream)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reset every live pairing. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.entries.values().for_each(|entry| entry.cancel.cancel());
        self.entries.len()
    }

    /// Number of pairings currently in `phase`.
    pub fn count_in(&self, phase: StreamPhase) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state.phase() == phase)
            .count()
    }
}
