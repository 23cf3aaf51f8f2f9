//! In-process transport
//!
//! Endpoints created from one [`MemoryNetwork`] can be linked to each other
//! and exchange datagrams through shared queues. Delivery is immediate and in
//! order; the unreliable tier can optionally drop a seeded fraction of sends
//! to exercise loss handling.

use super::{ConnectionEvent, Framing, PeerId, Reliability, Transport};
use crate::error::TransportError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Endpoint {
    inbox: VecDeque<(PeerId, Vec<u8>)>,
    events: Vec<ConnectionEvent>,
    links: BTreeSet<PeerId>,
    sent: usize,
}

struct Hub {
    next_id: u64,
    endpoints: HashMap<PeerId, Endpoint>,
    rng: StdRng,
    unreliable_loss: f64,
}

/// Shared medium for a set of [`MemoryTransport`] endpoints
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Lossless network
    pub fn new() -> Self {
        Self::with_unreliable_loss(0.0, 0)
    }

    /// Network that drops `loss` (0.0..=1.0) of unreliable-tier sends,
    /// reproducibly for a given `seed`
    pub fn with_unreliable_loss(loss: f64, seed: u64) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                next_id: 1,
                endpoints: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
                unreliable_loss: loss.clamp(0.0, 1.0),
            })),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new endpoint with a fresh peer id
    pub fn endpoint(&self) -> MemoryTransport {
        let mut hub = self.hub();
        let id = PeerId(hub.next_id);
        hub.next_id += 1;
        hub.endpoints.insert(id, Endpoint::default());
        MemoryTransport {
            id,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Link two endpoints; both observe a `Connected` event
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let mut hub = self.hub();
        if !hub.endpoints.contains_key(&a) || !hub.endpoints.contains_key(&b) {
            return;
        }
        link(&mut hub, a, b);
        link(&mut hub, b, a);
    }

    /// Break the link between two endpoints; both observe `Disconnected`
    pub fn sever(&self, a: PeerId, b: PeerId) {
        let mut hub = self.hub();
        unlink(&mut hub, a, b);
        unlink(&mut hub, b, a);
    }

    /// Deliver raw bytes to `to` as if `from` had sent them
    pub fn inject(&self, from: PeerId, to: PeerId, bytes: Vec<u8>) {
        if let Some(endpoint) = self.hub().endpoints.get_mut(&to) {
            endpoint.inbox.push_back((from, bytes));
        }
    }

    /// Buffers waiting in `peer`'s inbox
    pub fn pending(&self, peer: PeerId) -> usize {
        self.hub()
            .endpoints
            .get(&peer)
            .map(|e| e.inbox.len())
            .unwrap_or(0)
    }

    /// Buffers `peer` has handed to the network so far
    pub fn sent_by(&self, peer: PeerId) -> usize {
        self.hub()
            .endpoints
            .get(&peer)
            .map(|e| e.sent)
            .unwrap_or(0)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn link(hub: &mut Hub, from: PeerId, to: PeerId) {
    if let Some(endpoint) = hub.endpoints.get_mut(&from) {
        if endpoint.links.insert(to) {
            endpoint.events.push(ConnectionEvent::Connected(to));
        }
    }
}

fn unlink(hub: &mut Hub, from: PeerId, to: PeerId) {
    if let Some(endpoint) = hub.endpoints.get_mut(&from) {
        if endpoint.links.remove(&to) {
            endpoint.events.push(ConnectionEvent::Disconnected(to));
            endpoint.inbox.retain(|(sender, _)| *sender != to);
        }
    }
}

/// One endpoint of a [`MemoryNetwork`]
pub struct MemoryTransport {
    id: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransport {
    /// This endpoint's id as seen by the other endpoints
    pub fn id(&self) -> PeerId {
        self.id
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn framing(&self) -> Framing {
        Framing::Datagram
    }

    fn local_peer(&self) -> Option<PeerId> {
        Some(self.id)
    }

    fn poll(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        let id = self.id;
        self.hub()
            .endpoints
            .get_mut(&id)
            .map(|e| e.inbox.drain(..).collect())
            .unwrap_or_default()
    }

    fn poll_events(&mut self) -> Vec<ConnectionEvent> {
        let id = self.id;
        self.hub()
            .endpoints
            .get_mut(&id)
            .map(|e| std::mem::take(&mut e.events))
            .unwrap_or_default()
    }

    fn send(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        let id = self.id;
        let mut hub = self.hub();
        let linked = hub
            .endpoints
            .get(&id)
            .map(|e| e.links.contains(&peer))
            .ok_or(TransportError::Closed)?;
        if !linked {
            return Err(TransportError::UnknownPeer(peer));
        }
        if let Some(endpoint) = hub.endpoints.get_mut(&id) {
            endpoint.sent += 1;
        }

        if reliability == Reliability::Unreliable && hub.unreliable_loss > 0.0 {
            let loss = hub.unreliable_loss;
            if hub.rng.gen_bool(loss) {
                return Ok(());
            }
        }

        let target = hub
            .endpoints
            .get_mut(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        target.inbox.push_back((id, bytes.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId) {
        let id = self.id;
        let mut hub = self.hub();
        unlink(&mut hub, id, peer);
        unlink(&mut hub, peer, id);
    }
}
