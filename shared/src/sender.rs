//! Outbound addressing
//!
//! Messages are encoded once and queued per recipient; [`Sender::flush`]
//! hands the queue to the transport at the end of the tick. Clients live in
//! a star topology: the only peer a client may address is its host, and
//! everything a client wants others to see is fanned out by the host.

use crate::codec;
use crate::error::{SendError, TransportError};
use crate::messages::Message;
use crate::session::{Session, SessionRole};
use crate::transport::{PeerId, Reliability, Transport};
use log::{debug, error};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

struct Outgoing {
    peer: PeerId,
    bytes: Arc<[u8]>,
    reliability: Reliability,
}

/// Connected-peer set and outbox
#[derive(Default)]
pub struct Sender {
    peers: BTreeSet<PeerId>,
    outbox: VecDeque<Outgoing>,
}

impl Sender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    /// Forget a peer along with everything still queued for it
    pub fn disconnect(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        let before = self.outbox.len();
        self.outbox.retain(|o| o.peer != peer);
        let dropped = before - self.outbox.len();
        if dropped > 0 {
            debug!("Dropped {} queued messages for {}", dropped, peer);
        }
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Messages waiting for the next flush
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.outbox.clear();
    }

    pub fn send_to(
        &mut self,
        session: &Session,
        peer: PeerId,
        message: &Message,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        match session.role() {
            SessionRole::NotInSession => return Err(SendError::NotInSession),
            SessionRole::Client if session.host_peer() != Some(peer) => {
                return Err(SendError::ClientFanOut(peer))
            }
            _ => {}
        }
        let bytes: Arc<[u8]> = codec::encode(message)?.into();
        self.push(peer, bytes, reliability);
        Ok(())
    }

    /// Send to every connected peer. Host only.
    pub fn send_to_all(
        &mut self,
        session: &Session,
        message: &Message,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        self.send_to_all_excluding(session, message, &[], reliability)
    }

    /// Send to every connected peer not in `excluded`. Host only.
    pub fn send_to_all_excluding(
        &mut self,
        session: &Session,
        message: &Message,
        excluded: &[PeerId],
        reliability: Reliability,
    ) -> Result<(), SendError> {
        match session.role() {
            SessionRole::NotInSession => return Err(SendError::NotInSession),
            SessionRole::Client => return Err(SendError::ClientBroadcast),
            SessionRole::Host => {}
        }
        let recipients: Vec<PeerId> = self
            .peers
            .iter()
            .copied()
            .filter(|p| !excluded.contains(p))
            .collect();
        if recipients.is_empty() {
            return Ok(());
        }
        let bytes: Arc<[u8]> = codec::encode(message)?.into();
        for peer in recipients {
            self.push(peer, Arc::clone(&bytes), reliability);
        }
        Ok(())
    }

    /// Send to the host. Client only.
    pub fn send_to_host(
        &mut self,
        session: &Session,
        message: &Message,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        match (session.role(), session.host_peer()) {
            (SessionRole::NotInSession, _) => Err(SendError::NotInSession),
            (SessionRole::Client, Some(host)) => self.send_to(session, host, message, reliability),
            _ => Err(SendError::NotAClient),
        }
    }

    fn push(&mut self, peer: PeerId, bytes: Arc<[u8]>, reliability: Reliability) {
        if !self.peers.contains(&peer) {
            debug!("Not sending to {}: not connected", peer);
            return;
        }
        self.outbox.push_back(Outgoing {
            peer,
            bytes,
            reliability,
        });
    }

    /// Hand everything queued to the transport, in queue order.
    ///
    /// Failures do not stop the flush; they are logged and returned so the
    /// session layer can decide what to do with the peer.
    pub fn flush<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> (usize, Vec<(PeerId, TransportError)>) {
        let mut sent = 0;
        let mut failures = Vec::new();
        while let Some(outgoing) = self.outbox.pop_front() {
            match transport.send(outgoing.peer, &outgoing.bytes, outgoing.reliability) {
                Ok(()) => sent += 1,
                Err(e) => {
                    error!("Failed to send to {}: {}", outgoing.peer, e);
                    failures.push((outgoing.peer, e));
                }
            }
        }
        (sent, failures)
    }
}
