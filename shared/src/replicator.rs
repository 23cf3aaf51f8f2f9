//! One replication endpoint driven by the simulation tick
//!
//! A [`Replicator`] owns every piece of the core for one peer and runs them
//! in a fixed order on each [`Replicator::tick`]:
//!
//! 1. connection events update the peer set and drop per-connection queues
//! 2. inbound transport buffers are queued for dispatch
//! 3. the dispatch pipeline applies up to the per-tick cap
//! 4. due bulk queues are flushed into batches
//! 5. the sender hands everything queued to the transport
//!
//! The simulation reports its own changes through [`Replicator::replicate`]
//! and the spawn/despawn/action helpers between ticks.

use crate::batching::BatchQueue;
use crate::catalog::{KindDescriptor, MessageCatalog};
use crate::config::ReplicationConfig;
use crate::dispatch::{DispatchPipeline, DispatchStats, ProcessReport};
use crate::error::{ConfigurationError, SendError, SessionError, TransportError};
use crate::identity::{IdentityRegistry, NetId};
use crate::messages::{
    ApplyContext, EntityDestroy, EntitySpawn, FullSyncRequest, Message, MessageKind,
};
use crate::sender::Sender;
use crate::session::{Session, SessionRole};
use crate::transport::{ConnectionEvent, PeerId, Reliability, Transport};
use crate::world::{EntityKey, SimWorld};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

/// What happened during one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub connected: Vec<PeerId>,
    pub disconnected: Vec<PeerId>,
    /// Peers dropped for sending a datagram that ended mid-frame
    pub framing_errors: Vec<PeerId>,
    pub dispatch: ProcessReport,
    pub batches_flushed: usize,
    pub sent: usize,
    pub send_failures: Vec<(PeerId, TransportError)>,
}

pub struct Replicator<T: Transport> {
    transport: T,
    session: Session,
    catalog: Arc<MessageCatalog>,
    registry: IdentityRegistry,
    pipeline: DispatchPipeline,
    sender: Sender,
    batches: BatchQueue,
    config: ReplicationConfig,
}

impl<T: Transport> Replicator<T> {
    /// Validate `config` and build a replicator over the standard catalog
    pub fn new(transport: T, config: ReplicationConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);
        Ok(Self::with_catalog(transport, catalog, config))
    }

    pub fn with_catalog(transport: T, catalog: Arc<MessageCatalog>, config: ReplicationConfig) -> Self {
        let pipeline = DispatchPipeline::new(
            Arc::clone(&catalog),
            config.max_messages_per_poll(SessionRole::NotInSession),
        );
        let batches = BatchQueue::new(&catalog, Instant::now());
        Self {
            transport,
            session: Session::new(),
            catalog,
            registry: IdentityRegistry::new(),
            pipeline,
            sender: Sender::new(),
            batches,
            config,
        }
    }

    pub fn start_host(&mut self) -> Result<(), SessionError> {
        self.session.start_host()?;
        self.pipeline
            .set_max_per_poll(self.config.max_messages_per_poll(SessionRole::Host));
        Ok(())
    }

    /// Join the session hosted behind `host_peer`
    pub fn join(&mut self, host_peer: PeerId) -> Result<(), SessionError> {
        self.session.join(host_peer)?;
        self.pipeline
            .set_max_per_poll(self.config.max_messages_per_poll(SessionRole::Client));
        self.sender.connect(host_peer);
        Ok(())
    }

    /// Leave the session. Queues are dropped, identities are kept.
    pub fn leave(&mut self) {
        self.session.leave();
        self.sender.clear();
        self.pipeline.clear();
        self.batches.clear();
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn role(&self) -> SessionRole {
        self.session.role()
    }

    pub fn catalog(&self) -> &Arc<MessageCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &DispatchStats {
        self.pipeline.stats()
    }

    pub fn persistent_violators(&self) -> Vec<PeerId> {
        self.pipeline.persistent_violators()
    }

    /// Handle for producers on other threads
    pub fn batch_queue(&self) -> BatchQueue {
        self.batches.clone()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.sender.peers().collect()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn tick(&mut self, world: &mut dyn SimWorld, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for event in self.transport.poll_events() {
            match event {
                ConnectionEvent::Connected(peer) => self.on_connect(peer, &mut report),
                ConnectionEvent::Disconnected(peer) => self.on_disconnect(peer, &mut report),
            }
        }

        let framing = self.transport.framing();
        for (peer, bytes) in self.transport.poll() {
            if self.session.role() == SessionRole::NotInSession {
                debug!("Ignoring {} bytes from {} outside a session", bytes.len(), peer);
                continue;
            }
            if let Err(e) = self.pipeline.receive(framing, peer, &bytes) {
                warn!("Closing connection to {}: {}", peer, e);
                self.transport.disconnect(peer);
                self.forget_peer(peer);
                report.framing_errors.push(peer);
            }
        }

        report.dispatch =
            self.pipeline
                .process(&self.session, &mut self.registry, world, &mut self.sender);

        for batch in self.batches.flush(now) {
            let kind = batch.kind();
            let message = Message::from(batch);
            let result = self
                .outbound(kind)
                .and_then(|descriptor| self.route(&message, descriptor.reliability));
            match result {
                Ok(()) => report.batches_flushed += 1,
                Err(SendError::NotInSession) => {}
                Err(e) => warn!("Could not send {} batch: {}", kind.name(), e),
            }
        }

        let (sent, failures) = self.sender.flush(&mut self.transport);
        report.sent = sent;
        report.send_failures = failures;
        report
    }

    fn on_connect(&mut self, peer: PeerId, report: &mut TickReport) {
        match self.session.role() {
            SessionRole::Host => {
                info!("Peer {} joined the session", peer);
                self.sender.connect(peer);
            }
            SessionRole::Client if self.session.host_peer() == Some(peer) => {
                self.sender.connect(peer);
            }
            _ => debug!("Ignoring connection from {}", peer),
        }
        report.connected.push(peer);
    }

    fn on_disconnect(&mut self, peer: PeerId, report: &mut TickReport) {
        info!("Peer {} disconnected", peer);
        self.forget_peer(peer);
        if self.session.is_client() && self.session.host_peer() == Some(peer) {
            info!("Lost connection to host");
            self.leave();
        }
        report.disconnected.push(peer);
    }

    fn forget_peer(&mut self, peer: PeerId) {
        self.sender.disconnect(peer);
        self.pipeline.drop_peer(peer);
    }

    /// Rules for sending `kind` from this peer. The receiving role must be
    /// one that applies the kind.
    fn outbound(&self, kind: MessageKind) -> Result<KindDescriptor, SendError> {
        let role = self.session.role();
        let receiver = match role {
            SessionRole::Host => SessionRole::Client,
            SessionRole::Client => SessionRole::Host,
            SessionRole::NotInSession => return Err(SendError::NotInSession),
        };
        let descriptor = self
            .catalog
            .descriptor(kind)
            .copied()
            .ok_or(SendError::Unregistered(kind.name()))?;
        if !descriptor.authority.permits(receiver) {
            return Err(SendError::Unauthorized {
                kind: kind.name(),
                role,
            });
        }
        Ok(descriptor)
    }

    /// Host: everyone. Client: the host.
    fn route(&mut self, message: &Message, reliability: Reliability) -> Result<(), SendError> {
        match self.session.role() {
            SessionRole::Host => self.sender.send_to_all(&self.session, message, reliability),
            SessionRole::Client => self.sender.send_to_host(&self.session, message, reliability),
            SessionRole::NotInSession => Err(SendError::NotInSession),
        }
    }

    /// Send a simulation change with its kind's delivery rules. Bulk kinds
    /// are queued for the next due batch.
    ///
    /// Kinds the other side would reject (host state from a client, host
    /// requests from the host) fail here instead of on arrival.
    pub fn replicate(&mut self, message: impl Into<Message>) -> Result<(), SendError> {
        let message = message.into();
        let descriptor = self.outbound(message.governing_kind())?;
        let message = match self.batches.enqueue(message) {
            Ok(()) => return Ok(()),
            Err(message) => message,
        };
        self.route(&message, descriptor.reliability)
    }

    /// Spawn a host entity, register it and announce it. Host only.
    pub fn spawn_replicated(
        &mut self,
        world: &mut dyn SimWorld,
        prefab: &str,
        cell: i32,
    ) -> Result<(EntityKey, NetId), SendError> {
        if !self.session.is_host() {
            return Err(SendError::NotInSession);
        }
        let entity = world.spawn(prefab, cell);
        let id = self.registry.register(self.session.role(), entity)?;
        self.replicate(EntitySpawn {
            id,
            prefab: prefab.to_string(),
            cell,
        })?;
        Ok((entity, id))
    }

    /// Destroy a host entity and release its id everywhere
    pub fn despawn_replicated(
        &mut self,
        world: &mut dyn SimWorld,
        entity: EntityKey,
    ) -> Result<Option<NetId>, SendError> {
        if !self.session.is_host() {
            return Err(SendError::NotInSession);
        }
        world.despawn(entity);
        let Some(id) = self.registry.release_entity(entity) else {
            return Ok(None);
        };
        self.replicate(EntityDestroy { id })?;
        Ok(Some(id))
    }

    /// Net id of a host entity, registering it on first use
    pub fn net_id(&mut self, entity: EntityKey) -> Result<NetId, SendError> {
        Ok(self.registry.register(self.session.role(), entity)?)
    }

    /// Perform a local player action and share it.
    ///
    /// The action is applied here first. The host then sends it to every
    /// client; a client sends it to the host, which forwards it to the other
    /// clients but never back to this one.
    ///
    /// Only kinds this role both applies and may send qualify. Nothing is
    /// sent if the local apply fails.
    pub fn perform_action(
        &mut self,
        world: &mut dyn SimWorld,
        action: impl Into<Message>,
    ) -> Result<(), SendError> {
        let local = self
            .transport
            .local_peer()
            .ok_or(SendError::NotInSession)?;
        let role = self.session.role();

        let mut message = action.into();
        let kind = message.governing_kind();
        let descriptor = self.outbound(kind)?;
        if !descriptor.authority.permits(role) {
            return Err(SendError::NotApplicable {
                kind: kind.name(),
                role,
            });
        }
        message.stamp_origin(local);

        let mut ctx = ApplyContext::new(role, local, &mut self.registry, world);
        let applied = message.apply(&mut ctx);
        drop(ctx);
        if let Err(e) = applied {
            debug!("Local {} had no effect: {}", kind.name(), e);
            return Err(e.into());
        }

        self.replicate(message)
    }

    /// Ask the host to re-announce every live entity. Client only.
    pub fn request_full_sync(&mut self) -> Result<(), SendError> {
        self.sender
            .send_to_host(&self.session, &Message::from(FullSyncRequest {}), Reliability::Reliable)
    }
}
