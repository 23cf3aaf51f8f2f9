//! Inbound dispatch pipeline
//!
//! Each inbound frame moves through
//! `Received -> Decoded -> AuthorityChecked -> Applied | Dropped`, and kinds
//! marked for rebroadcast are then forwarded by the host to every other
//! peer. Frames are queued in arrival order and processed up to a per-tick
//! cap; whatever is left waits for the next tick.
//!
//! Nothing in here is fatal to the session. Decode failures, wrong-role
//! arrivals and unresolved targets are logged, counted and dropped. The
//! connection-fatal cases are a datagram that ends in a partial frame and a
//! stream frame announcing more than [`codec::MAX_PAYLOAD_LEN`] bytes, which
//! [`DispatchPipeline::receive`] reports to the caller.

use crate::catalog::{KindDescriptor, MessageCatalog};
use crate::codec::{self, FrameBuffer};
use crate::error::{ApplyError, CodecError};
use crate::identity::IdentityRegistry;
use crate::messages::{ApplyContext, Message};
use crate::sender::Sender;
use crate::session::{Session, SessionRole};
use crate::transport::{Framing, PeerId};
use crate::world::SimWorld;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Authority violations after which a peer is reported as misbehaving
pub const PERSISTENT_VIOLATION_THRESHOLD: u32 = 16;

/// Cumulative pipeline counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub applied: u64,
    pub rebroadcast: u64,
    pub decode_drops: u64,
    pub unknown_kinds: u64,
    pub authority_violations: u64,
    pub unresolved: u64,
}

/// Result of one [`DispatchPipeline::process`] call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: usize,
    pub applied: usize,
    pub dropped: usize,
    /// Frames still queued for later ticks
    pub remaining: usize,
}

pub struct DispatchPipeline {
    catalog: Arc<MessageCatalog>,
    max_per_poll: usize,
    inbound: VecDeque<(PeerId, Vec<u8>)>,
    streams: HashMap<PeerId, FrameBuffer>,
    violations: HashMap<PeerId, u32>,
    stats: DispatchStats,
}

enum Applied {
    Yes,
    No,
}

impl DispatchPipeline {
    pub fn new(catalog: Arc<MessageCatalog>, max_per_poll: usize) -> Self {
        Self {
            catalog,
            max_per_poll: max_per_poll.max(1),
            inbound: VecDeque::new(),
            streams: HashMap::new(),
            violations: HashMap::new(),
            stats: DispatchStats::default(),
        }
    }

    pub fn set_max_per_poll(&mut self, max_per_poll: usize) {
        self.max_per_poll = max_per_poll.max(1);
    }

    pub fn max_per_poll(&self) -> usize {
        self.max_per_poll
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Frames waiting to be processed
    pub fn queued(&self) -> usize {
        self.inbound.len()
    }

    /// Peers whose authority violations reached the reporting threshold
    pub fn persistent_violators(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .violations
            .iter()
            .filter(|(_, count)| **count >= PERSISTENT_VIOLATION_THRESHOLD)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Queue a buffer polled from `peer`.
    ///
    /// With datagram framing a buffer that does not end on a frame boundary
    /// is rejected whole and the error should end the connection. Stream
    /// bytes are reassembled and partial frames wait for more data, unless
    /// the header announces an oversized payload.
    pub fn receive(&mut self, framing: Framing, peer: PeerId, bytes: &[u8]) -> Result<(), CodecError> {
        match framing {
            Framing::Datagram => {
                let frames = codec::split_datagram(bytes)?;
                self.inbound
                    .extend(frames.into_iter().map(|f| (peer, f.to_vec())));
            }
            Framing::Stream => {
                let buffer = self.streams.entry(peer).or_default();
                buffer.extend(bytes);
                while let Some(frame) = buffer.next_frame()? {
                    self.inbound.push_back((peer, frame));
                }
            }
        }
        Ok(())
    }

    /// Forget everything queued from `peer`
    pub fn drop_peer(&mut self, peer: PeerId) {
        let before = self.inbound.len();
        self.inbound.retain(|(p, _)| *p != peer);
        self.streams.remove(&peer);
        self.violations.remove(&peer);
        let dropped = before - self.inbound.len();
        if dropped > 0 {
            debug!("Dropped {} unprocessed frames from {}", dropped, peer);
        }
    }

    pub fn clear(&mut self) {
        self.inbound.clear();
        self.streams.clear();
        self.violations.clear();
    }

    /// Process up to the per-tick cap of queued frames, in arrival order
    pub fn process(
        &mut self,
        session: &Session,
        registry: &mut IdentityRegistry,
        world: &mut dyn SimWorld,
        sender: &mut Sender,
    ) -> ProcessReport {
        let mut report = ProcessReport::default();

        while report.processed < self.max_per_poll {
            let Some((peer, frame)) = self.inbound.pop_front() else {
                break;
            };
            report.processed += 1;
            self.stats.received += 1;

            match self.dispatch(session, registry, world, sender, peer, &frame) {
                Applied::Yes => report.applied += 1,
                Applied::No => report.dropped += 1,
            }
        }

        report.remaining = self.inbound.len();
        report
    }

    fn dispatch(
        &mut self,
        session: &Session,
        registry: &mut IdentityRegistry,
        world: &mut dyn SimWorld,
        sender: &mut Sender,
        peer: PeerId,
        frame: &[u8],
    ) -> Applied {
        // Decoded
        let mut message = match codec::decode(&self.catalog, frame) {
            Ok((_, message)) => message,
            Err(CodecError::UnknownMessageKind { tag, payload_length }) => {
                self.stats.unknown_kinds += 1;
                debug!(
                    "Skipping unknown message kind {} ({} bytes) from {}",
                    tag, payload_length, peer
                );
                return Applied::No;
            }
            Err(e) => {
                self.stats.decode_drops += 1;
                warn!("Dropping undecodable frame from {}: {}", peer, e);
                return Applied::No;
            }
        };

        // AuthorityChecked
        let Some(descriptor) = self.catalog.descriptor(message.governing_kind()).copied() else {
            self.stats.unknown_kinds += 1;
            return Applied::No;
        };
        if !self.authorized(session, peer, &descriptor) {
            return Applied::No;
        }
        if session.is_host() {
            message.stamp_origin(peer);
        }

        // Applied
        let mut ctx = ApplyContext::new(session.role(), peer, registry, world);
        let applied = match &message {
            Message::Batch(batch) => {
                let mut any = false;
                for item in batch.items() {
                    any |= self.apply_one(item, &mut ctx, peer);
                }
                any
            }
            single => self.apply_one(single, &mut ctx, peer),
        };
        let replies = std::mem::take(&mut ctx.replies);
        drop(ctx);

        for reply in replies {
            let reliability = self
                .catalog
                .descriptor(reply.kind())
                .map(|d| d.reliability)
                .unwrap_or(descriptor.reliability);
            if let Err(e) = sender.send_to(session, peer, &reply, reliability) {
                warn!("Could not reply to {}: {}", peer, e);
            }
        }

        if !applied {
            return Applied::No;
        }

        // Rebroadcast
        if session.is_host() && descriptor.rebroadcast {
            match sender.send_to_all_excluding(session, &message, &[peer], descriptor.reliability) {
                Ok(()) => self.stats.rebroadcast += 1,
                Err(e) => warn!("Could not rebroadcast {}: {}", descriptor.name(), e),
            }
        }
        Applied::Yes
    }

    fn authorized(&mut self, session: &Session, peer: PeerId, descriptor: &KindDescriptor) -> bool {
        let role = session.role();
        let from_host = session.host_peer() == Some(peer);

        let reason = if role == SessionRole::NotInSession {
            Some("not in a session")
        } else if role == SessionRole::Client && !from_host {
            Some("clients only accept messages from the host")
        } else if !descriptor.authority.permits(role) {
            Some("wrong role")
        } else {
            None
        };

        let Some(reason) = reason else {
            return true;
        };

        self.stats.authority_violations += 1;
        let count = self.violations.entry(peer).or_insert(0);
        *count += 1;
        warn!(
            "Dropping {} from {} on {}: {}",
            descriptor.name(),
            peer,
            role,
            reason
        );
        if *count == PERSISTENT_VIOLATION_THRESHOLD {
            warn!("{} keeps sending messages it has no authority for", peer);
        }
        false
    }

    fn apply_one(&mut self, message: &Message, ctx: &mut ApplyContext<'_>, peer: PeerId) -> bool {
        match message.apply(ctx) {
            Ok(()) => {
                self.stats.applied += 1;
                true
            }
            Err(
                e @ (ApplyError::UnresolvedIdentity(_)
                | ApplyError::StaleEntity(_)
                | ApplyError::InvalidTarget),
            ) => {
                self.stats.unresolved += 1;
                debug!("Ignoring {} from {}: {}", message.kind().name(), peer, e);
                false
            }
            Err(e) => {
                warn!("Failed to apply {} from {}: {}", message.kind().name(), peer, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NetId;
    use crate::messages::{
        Batch, CellUpdate, DigAction, EntitySpawn, FullSyncRequest, MessageKind, ToggleEffect,
    };
    use crate::session::Session;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::Transport;
    use crate::world::{MirrorWorld, SimWorld};

    const HOST: PeerId = PeerId(100);

    fn pipeline(cap: usize) -> DispatchPipeline {
        DispatchPipeline::new(Arc::new(MessageCatalog::standard()), cap)
    }

    fn frame(message: impl Into<Message>) -> Vec<u8> {
        codec::encode(&message.into()).unwrap()
    }

    fn client_session() -> Session {
        let mut session = Session::new();
        session.join(HOST).unwrap();
        session
    }

    fn host_session() -> Session {
        let mut session = Session::new();
        session.start_host().unwrap();
        session
    }

    fn cell(n: i32) -> Message {
        Message::from(CellUpdate {
            cell: n,
            element: 1,
            mass: 10.0,
            temperature: 280.0,
        })
    }

    #[test]
    fn test_client_applies_host_state() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = client_session();

        pipeline
            .receive(
                Framing::Datagram,
                HOST,
                &frame(EntitySpawn {
                    id: NetId(1),
                    prefab: "Duplicant".to_string(),
                    cell: 5,
                }),
            )
            .unwrap();
        pipeline
            .receive(
                Framing::Datagram,
                HOST,
                &frame(ToggleEffect {
                    target: NetId(1),
                    adding: true,
                    effect: "Overjoyed".to_string(),
                }),
            )
            .unwrap();

        let report = pipeline.process(&session, &mut registry, &mut world, &mut sender);
        assert_eq!(report.applied, 2);

        let entity = registry.resolve(NetId(1)).unwrap();
        assert!(world.has_effect(entity, "Overjoyed"));
    }

    #[test]
    fn test_host_drops_client_only_kinds() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = host_session();

        pipeline
            .receive(
                Framing::Datagram,
                PeerId(1),
                &frame(EntitySpawn {
                    id: NetId(1),
                    prefab: "Duplicant".to_string(),
                    cell: 5,
                }),
            )
            .unwrap();
        let report = pipeline.process(&session, &mut registry, &mut world, &mut sender);

        assert_eq!(report.dropped, 1);
        assert_eq!(world.entity_count(), 0);
        assert_eq!(pipeline.stats().authority_violations, 1);
    }

    #[test]
    fn test_client_ignores_non_host_sources() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = client_session();

        pipeline
            .receive(Framing::Datagram, PeerId(7), &frame(cell(1)))
            .unwrap();
        pipeline.process(&session, &mut registry, &mut world, &mut sender);

        assert!(world.cell(1).is_none());
        assert_eq!(pipeline.stats().authority_violations, 1);
    }

    #[test]
    fn test_client_drops_host_only_kinds() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = client_session();
        sender.connect(HOST);

        pipeline
            .receive(Framing::Datagram, HOST, &frame(FullSyncRequest {}))
            .unwrap();
        pipeline.process(&session, &mut registry, &mut world, &mut sender);
        assert_eq!(sender.pending(), 0);
        assert_eq!(pipeline.stats().authority_violations, 1);
    }

    #[test]
    fn test_unresolved_target_is_silent_noop() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = client_session();

        pipeline
            .receive(
                Framing::Datagram,
                HOST,
                &frame(ToggleEffect {
                    target: NetId(3),
                    adding: true,
                    effect: "Overjoyed".to_string(),
                }),
            )
            .unwrap();
        let report = pipeline.process(&session, &mut registry, &mut world, &mut sender);

        assert_eq!(report.dropped, 1);
        assert_eq!(pipeline.stats().unresolved, 1);
        assert_eq!(pipeline.stats().authority_violations, 0);
    }

    #[test]
    fn test_unknown_kind_is_skipped() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = client_session();

        let mut datagram = Vec::new();
        codec::write_frame(999, &[0xEE; 7], &mut datagram).unwrap();
        datagram.extend(frame(cell(12)));
        pipeline
            .receive(Framing::Datagram, HOST, &datagram)
            .unwrap();

        let report = pipeline.process(&session, &mut registry, &mut world, &mut sender);
        assert_eq!(report.processed, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(pipeline.stats().unknown_kinds, 1);
        assert!(world.cell(12).is_some());
    }

    #[test]
    fn test_partial_datagram_is_fatal() {
        let mut pipeline = pipeline(10);
        let bytes = frame(cell(1));
        let result = pipeline.receive(Framing::Datagram, HOST, &bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(CodecError::TruncatedPayload { .. })));
        assert_eq!(pipeline.queued(), 0);
    }

    #[test]
    fn test_stream_frames_wait_for_remaining_bytes() {
        let mut pipeline = pipeline(10);
        let bytes = frame(cell(1));

        pipeline
            .receive(Framing::Stream, HOST, &bytes[..4])
            .unwrap();
        assert_eq!(pipeline.queued(), 0);
        pipeline
            .receive(Framing::Stream, HOST, &bytes[4..])
            .unwrap();
        assert_eq!(pipeline.queued(), 1);
    }

    #[test]
    fn test_oversized_stream_frame_is_fatal() {
        let mut pipeline = pipeline(10);
        let mut header = MessageKind::CellUpdate.tag().to_le_bytes().to_vec();
        header.extend_from_slice(&u32::MAX.to_le_bytes());

        let err = pipeline
            .receive(Framing::Stream, HOST, &header)
            .unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
        assert!(!err.is_recoverable());
        assert_eq!(pipeline.queued(), 0);
    }

    #[test]
    fn test_cap_per_tick_preserves_order() {
        let mut pipeline = pipeline(3);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = client_session();

        for n in 0..7 {
            pipeline
                .receive(Framing::Datagram, HOST, &frame(cell(n)))
                .unwrap();
        }

        let first = pipeline.process(&session, &mut registry, &mut world, &mut sender);
        assert_eq!(first.processed, 3);
        assert_eq!(first.remaining, 4);
        assert!(world.cell(2).is_some());
        assert!(world.cell(3).is_none());

        pipeline.process(&session, &mut registry, &mut world, &mut sender);
        let last = pipeline.process(&session, &mut registry, &mut world, &mut sender);
        assert_eq!(last.processed, 1);
        assert_eq!(last.remaining, 0);

        let order: Vec<i32> = world
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                crate::world::WorldEvent::CellChanged(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(order, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_host_rebroadcasts_to_others_only() {
        let network = MemoryNetwork::new();
        let mut host = network.endpoint();
        let mut a = network.endpoint();
        let mut b = network.endpoint();
        network.connect(host.id(), a.id());
        network.connect(host.id(), b.id());

        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        sender.connect(a.id());
        sender.connect(b.id());
        let session = host_session();

        pipeline
            .receive(
                Framing::Datagram,
                a.id(),
                &frame(DigAction {
                    origin: a.id(),
                    cell: 42,
                }),
            )
            .unwrap();
        pipeline.process(&session, &mut registry, &mut world, &mut sender);
        sender.flush(&mut host);

        assert_eq!(world.dig_count(42), 1);
        assert!(a.poll().is_empty());

        let delivered = b.poll();
        assert_eq!(delivered.len(), 1);
        let catalog = MessageCatalog::standard();
        let (_, message) = codec::decode(&catalog, &delivered[0].1).unwrap();
        assert_eq!(message.origin(), Some(a.id()));
        assert_eq!(pipeline.stats().rebroadcast, 1);
    }

    #[test]
    fn test_host_stamps_true_origin() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = host_session();

        pipeline
            .receive(
                Framing::Datagram,
                PeerId(3),
                &frame(DigAction {
                    origin: PeerId(9),
                    cell: 1,
                }),
            )
            .unwrap();
        pipeline.process(&session, &mut registry, &mut world, &mut sender);

        assert_eq!(
            world.events(),
            &[crate::world::WorldEvent::Dug {
                cell: 1,
                origin: PeerId(3)
            }]
        );
    }

    #[test]
    fn test_batch_items_follow_inner_kind_rules() {
        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();

        let batch = Batch::new(MessageKind::CellUpdate, vec![cell(1), cell(2), cell(3)]).unwrap();
        let bytes = frame(batch);

        // a host never applies cell updates, batched or not
        let host = host_session();
        pipeline
            .receive(Framing::Datagram, PeerId(1), &bytes)
            .unwrap();
        pipeline.process(&host, &mut registry, &mut world, &mut sender);
        assert!(world.cell(1).is_none());

        let client = client_session();
        pipeline.receive(Framing::Datagram, HOST, &bytes).unwrap();
        let report = pipeline.process(&client, &mut registry, &mut world, &mut sender);
        assert_eq!(report.applied, 1);
        assert_eq!(pipeline.stats().applied, 3);
        assert!(world.cell(3).is_some());
    }

    #[test]
    fn test_full_sync_replies_to_requester() {
        let network = MemoryNetwork::new();
        let mut host = network.endpoint();
        let mut a = network.endpoint();
        let mut b = network.endpoint();
        network.connect(host.id(), a.id());
        network.connect(host.id(), b.id());

        let mut pipeline = pipeline(10);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        sender.connect(a.id());
        sender.connect(b.id());
        let session = host_session();

        let key = world.spawn("Duplicant", 9);
        let id = registry.register(SessionRole::Host, key).unwrap();

        pipeline
            .receive(Framing::Datagram, b.id(), &frame(FullSyncRequest {}))
            .unwrap();
        pipeline.process(&session, &mut registry, &mut world, &mut sender);
        sender.flush(&mut host);

        assert!(a.poll().is_empty());
        let delivered = b.poll();
        assert_eq!(delivered.len(), 1);
        let catalog = MessageCatalog::standard();
        let (_, message) = codec::decode(&catalog, &delivered[0].1).unwrap();
        assert_eq!(
            message,
            Message::from(EntitySpawn {
                id,
                prefab: "Duplicant".to_string(),
                cell: 9,
            })
        );
    }

    #[test]
    fn test_persistent_violator_reported() {
        let mut pipeline = pipeline(100);
        let mut registry = IdentityRegistry::new();
        let mut world = MirrorWorld::new();
        let mut sender = Sender::new();
        let session = host_session();

        for _ in 0..PERSISTENT_VIOLATION_THRESHOLD {
            pipeline
                .receive(Framing::Datagram, PeerId(5), &frame(cell(0)))
                .unwrap();
        }
        pipeline.process(&session, &mut registry, &mut world, &mut sender);
        assert_eq!(pipeline.persistent_violators(), vec![PeerId(5)]);

        pipeline.drop_peer(PeerId(5));
        assert!(pipeline.persistent_violators().is_empty());
    }

    #[test]
    fn test_drop_peer_discards_queued_frames() {
        let mut pipeline = pipeline(10);
        pipeline
            .receive(Framing::Datagram, PeerId(1), &frame(cell(0)))
            .unwrap();
        pipeline
            .receive(Framing::Datagram, PeerId(2), &frame(cell(1)))
            .unwrap();

        pipeline.drop_peer(PeerId(1));
        assert_eq!(pipeline.queued(), 1);
    }
}
