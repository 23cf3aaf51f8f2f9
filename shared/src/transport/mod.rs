//! Transport contract consumed by the replication core
//!
//! Concrete socket or relay implementations live outside the core. The core
//! only needs non-blocking `poll`, `send` with a reliability tier, and
//! discrete connection lifecycle events delivered on the tick thread.

pub mod datagram;
pub mod memory;

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for a remote peer, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

/// Delivery guarantee class, chosen per message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reliability {
    /// Ordered and retransmitted by the transport
    Reliable,
    /// Best effort, may be dropped or reordered
    Unreliable,
}

/// How the transport delimits messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every polled buffer holds whole frames only
    Datagram,
    /// Bytes may be split or coalesced arbitrarily; the codec length prefix
    /// is the only boundary
    Stream,
}

/// Connection lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Non-blocking, polled transport
///
/// Every method is called from the tick thread and must return immediately.
pub trait Transport {
    /// Boundary guarantee of `poll`
    fn framing(&self) -> Framing;

    /// How remote peers address this endpoint, once known
    fn local_peer(&self) -> Option<PeerId>;

    /// Drain whatever inbound buffers are available right now
    fn poll(&mut self) -> Vec<(PeerId, Vec<u8>)>;

    /// Drain pending lifecycle events
    fn poll_events(&mut self) -> Vec<ConnectionEvent>;

    /// Queue `bytes` for delivery to `peer`
    fn send(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError>;

    /// Drop a connection, e.g. after a fatal framing error
    fn disconnect(&mut self, peer: PeerId);
}
