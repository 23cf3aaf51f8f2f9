//! Control envelope for datagram transports
//!
//! UDP has no connection lifecycle of its own, so the host and client
//! transports wrap every datagram in a small bincode-encoded envelope that
//! carries the handshake, liveness and replication payloads.

use super::PeerId;
use crate::error::TransportError;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Handshake version; peers with a different version are refused
pub const PROTOCOL_VERSION: u32 = 1;

/// Receive buffer size for a single datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// How long a silent peer stays connected
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// How often an idle side sends a heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// The id a client transport uses for its host connection
pub const HOST_PEER: PeerId = PeerId(0);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Hello { protocol_version: u32 },
    Welcome { peer_id: PeerId },
    Refused { reason: String },
    Heartbeat,
    Goodbye,
    Data { payload: Vec<u8> },
}

pub fn encode_packet(packet: &ControlPacket) -> Result<Vec<u8>, TransportError> {
    serialize(packet).map_err(|e| TransportError::Io(e.to_string()))
}

/// Returns `None` for datagrams that are not control packets
pub fn decode_packet(bytes: &[u8]) -> Option<ControlPacket> {
    deserialize(bytes).ok()
}
