//! Client network layer: UDP link to the host and the mirror tick loop

use crate::actions::ActionScript;
use log::{debug, error, info, warn};
use shared::transport::datagram::{
    decode_packet, encode_packet, ControlPacket, HEARTBEAT_INTERVAL, HOST_PEER, MAX_DATAGRAM_SIZE,
    PEER_TIMEOUT, PROTOCOL_VERSION,
};
use shared::world::MirrorWorld;
use shared::{
    ConnectionEvent, Framing, PeerId, Reliability, ReplicationConfig, Replicator, SessionRole,
    Transport, TransportError,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

/// How often an unanswered hello is repeated
pub const HELLO_RETRY: Duration = Duration::from_millis(500);

/// How long to wait for the host to answer at all
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting { started: Instant, last_hello: Instant },
    Connected { peer_id: PeerId },
    Closed,
}

/// Non-blocking UDP link to a single host
///
/// Driven with `try_recv`/`try_send` on a connected tokio socket, so the
/// replicator can poll it from inside the tick without awaiting.
///
/// The host is always addressed as [`HOST_PEER`]. The id the host assigns to
/// this client during the handshake is reported through `local_peer`.
pub struct UdpClientTransport {
    socket: UdpSocket,
    server: SocketAddr,
    state: LinkState,
    events: Vec<ConnectionEvent>,
    inbound: Vec<(PeerId, Vec<u8>)>,
    last_heard: Instant,
    last_sent: Instant,
    refusal: Option<String>,
    buffer: Vec<u8>,
}

impl UdpClientTransport {
    /// Bind an ephemeral port and start the handshake with `server`
    pub async fn connect(server: &str) -> Result<Self, TransportError> {
        let server: SocketAddr = server
            .parse()
            .map_err(|e| TransportError::Io(format!("invalid host address {}: {}", server, e)))?;
        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        socket.writable().await?;

        let now = Instant::now();
        let transport = Self {
            socket,
            server,
            state: LinkState::Connecting {
                started: now,
                last_hello: now,
            },
            events: Vec::new(),
            inbound: Vec::new(),
            last_heard: now,
            last_sent: now,
            refusal: None,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        };

        info!("Connecting to host at {}...", server);
        transport.send_control(&ControlPacket::Hello {
            protocol_version: PROTOCOL_VERSION,
        });
        Ok(transport)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Closed
    }

    /// Why the host turned us away, if it did
    pub fn refusal(&self) -> Option<&str> {
        self.refusal.as_deref()
    }

    fn close(&mut self) {
        if self.is_connected() {
            self.events.push(ConnectionEvent::Disconnected(HOST_PEER));
        }
        self.state = LinkState::Closed;
    }

    fn pump(&mut self) {
        let now = Instant::now();

        loop {
            match self.socket.try_recv(&mut self.buffer) {
                Ok(len) => match decode_packet(&self.buffer[..len]) {
                    Some(packet) => self.handle_packet(packet, now),
                    None => warn!("Dropping malformed datagram ({} bytes) from host", len),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // the host is not listening (yet); the hello retry covers it
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    break;
                }
            }
        }

        match self.state {
            LinkState::Connecting { started, last_hello } => {
                if now.saturating_duration_since(started) > CONNECT_TIMEOUT {
                    warn!("No answer from host at {}", self.server);
                    self.refusal = Some("no answer from host".to_string());
                    self.close();
                } else if now.saturating_duration_since(last_hello) >= HELLO_RETRY {
                    debug!("Repeating hello to {}", self.server);
                    self.send_control(&ControlPacket::Hello {
                        protocol_version: PROTOCOL_VERSION,
                    });
                    self.state = LinkState::Connecting {
                        started,
                        last_hello: now,
                    };
                }
            }
            LinkState::Connected { .. } => {
                if now.saturating_duration_since(self.last_heard) > PEER_TIMEOUT {
                    info!("Host timed out");
                    self.close();
                } else if now.saturating_duration_since(self.last_sent) >= HEARTBEAT_INTERVAL {
                    self.send_control(&ControlPacket::Heartbeat);
                    self.last_sent = now;
                }
            }
            LinkState::Closed => {}
        }
    }

    fn handle_packet(&mut self, packet: ControlPacket, now: Instant) {
        match packet {
            ControlPacket::Welcome { peer_id } => match self.state {
                LinkState::Connecting { .. } => {
                    info!("Connected! Peer id: {}", peer_id);
                    self.state = LinkState::Connected { peer_id };
                    self.last_heard = now;
                    self.events.push(ConnectionEvent::Connected(HOST_PEER));
                }
                LinkState::Connected { .. } => {
                    // answer to a repeated hello; the host now knows us by this id
                    debug!("Host reassigned peer id {}", peer_id);
                    self.state = LinkState::Connected { peer_id };
                    self.last_heard = now;
                }
                LinkState::Closed => {}
            },

            ControlPacket::Refused { reason } => {
                warn!("Refused by host: {}", reason);
                self.refusal = Some(reason);
                self.close();
            }

            ControlPacket::Heartbeat => self.last_heard = now,

            ControlPacket::Goodbye => {
                if self.is_connected() {
                    info!("Host closed the connection");
                    self.close();
                }
            }

            ControlPacket::Data { payload } => {
                if self.is_connected() {
                    self.last_heard = now;
                    self.inbound.push((HOST_PEER, payload));
                }
            }

            ControlPacket::Hello { .. } => warn!("Unexpected packet type from host"),
        }
    }

    fn send_control(&self, packet: &ControlPacket) {
        let result = encode_packet(packet)
            .and_then(|bytes| self.socket.try_send(&bytes).map_err(TransportError::from));
        if let Err(e) = result {
            debug!("Failed to send control packet: {}", e);
        }
    }
}

impl Transport for UdpClientTransport {
    fn framing(&self) -> Framing {
        Framing::Datagram
    }

    fn local_peer(&self) -> Option<PeerId> {
        match self.state {
            LinkState::Connected { peer_id } => Some(peer_id),
            _ => None,
        }
    }

    fn poll(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        self.pump();
        std::mem::take(&mut self.inbound)
    }

    fn poll_events(&mut self) -> Vec<ConnectionEvent> {
        self.pump();
        std::mem::take(&mut self.events)
    }

    fn send(&mut self, peer: PeerId, bytes: &[u8], _reliability: Reliability) -> Result<(), TransportError> {
        if peer != HOST_PEER {
            return Err(TransportError::UnknownPeer(peer));
        }
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let datagram = encode_packet(&ControlPacket::Data {
            payload: bytes.to_vec(),
        })?;
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Io(format!(
                "datagram of {} bytes exceeds {}",
                datagram.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        self.socket.try_send(&datagram)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId) {
        if peer == HOST_PEER && !self.is_closed() {
            self.send_control(&ControlPacket::Goodbye);
            self.close();
        }
    }
}

/// Client process: the replicator, the mirrored world and the player
pub struct Client {
    replicator: Replicator<UdpClientTransport>,
    world: MirrorWorld,
    actions: ActionScript,
    tick_duration: Duration,
    tick: u64,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        tick_duration: Duration,
        config: ReplicationConfig,
        actions: ActionScript,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = UdpClientTransport::connect(server_addr).await?;
        let mut replicator = Replicator::new(transport, config)?;
        replicator.join(HOST_PEER)?;

        Ok(Client {
            replicator,
            world: MirrorWorld::new(),
            actions,
            tick_duration,
            tick: 0,
        })
    }

    pub fn replicator(&self) -> &Replicator<UdpClientTransport> {
        &self.replicator
    }

    pub fn world(&self) -> &MirrorWorld {
        &self.world
    }

    /// One replication tick plus this tick's player actions. Returns false
    /// once the session is over.
    pub fn step(&mut self, now: Instant) -> bool {
        let report = self.replicator.tick(&mut self.world, now);

        if report.connected.contains(&HOST_PEER) {
            info!("Requesting full world state");
            if let Err(e) = self.replicator.request_full_sync() {
                error!("Error requesting full sync: {}", e);
            }
        }
        if self.replicator.role() == SessionRole::NotInSession || self.replicator.transport().is_closed() {
            return false;
        }

        if self.replicator.transport().is_connected() {
            for action in self.actions.actions_for(self.tick) {
                if let Err(e) = self.replicator.perform_action(&mut self.world, action) {
                    error!("Error sending action: {}", e);
                }
            }
        }

        let changes = self.world.drain_events().len();
        if self.tick % 60 == 0 && self.tick > 0 {
            let stats = self.replicator.stats();
            debug!(
                "Tick {}: {} entities mirrored, {} changes, {} applied, {} dropped",
                self.tick,
                self.world.entity_count(),
                changes,
                stats.applied,
                stats.decode_drops + stats.authority_violations + stats.unresolved
            );
        }

        self.tick += 1;
        true
    }

    /// Main client loop; returns when the host goes away or on ctrl-c
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if !self.step(Instant::now()) {
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Client shutting down");
                    break;
                }
            }
        }

        if let Some(reason) = self.replicator.transport().refusal() {
            return Err(format!("could not join {}: {}", self.replicator.transport().server_addr(), reason).into());
        }

        self.replicator.transport_mut().disconnect(HOST_PEER);
        Ok(())
    }
}
