//! Connected peer roster for the UDP host transport
//!
//! This module tracks which socket addresses have completed the handshake:
//! - Peer id assignment (ids start at 1; 0 names the host itself)
//! - Capacity enforcement
//! - Liveness bookkeeping and timeout detection
//!
//! The table is purely bookkeeping. Lifecycle events and logging are the
//! transport's job.

use shared::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A peer that completed the handshake
#[derive(Debug, Clone)]
pub struct Peer {
    /// Id assigned by the host
    pub id: PeerId,
    /// Address datagrams are sent to
    pub addr: SocketAddr,
    /// Last time any datagram arrived from this peer
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
        }
    }

    /// Whether nothing has been heard from the peer for longer than `timeout`
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// All connected peers, keyed by id
///
/// Ids increase monotonically and are never reused within one host run, so
/// a stale datagram can never be attributed to a newer peer.
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    next_peer_id: u64,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
        }
    }

    /// Admit a new peer. Returns `None` when the table is full.
    pub fn add_peer(&mut self, addr: SocketAddr, now: Instant) -> Option<PeerId> {
        if self.is_full() {
            return None;
        }

        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        self.peers.insert(id, Peer::new(id, addr, now));
        Some(id)
    }

    pub fn remove_peer(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|peer| peer.addr == addr)
            .map(|peer| peer.id)
    }

    pub fn addr_of(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.get(&id).map(|peer| peer.addr)
    }

    /// Record activity from a peer
    pub fn touch(&mut self, id: PeerId, now: Instant) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_seen = now;
        }
    }

    /// Remove and return every peer silent for longer than `timeout`
    pub fn check_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let timed_out: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(now, timeout))
            .map(|peer| peer.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }

    /// Every peer with its address, in id order
    pub fn addrs(&self) -> Vec<(PeerId, SocketAddr)> {
        let mut addrs: Vec<_> = self.peers.values().map(|p| (p.id, p.addr)).collect();
        addrs.sort_by_key(|(id, _)| *id);
        addrs
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }
}
