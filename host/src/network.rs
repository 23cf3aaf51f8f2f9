//! Host network layer: UDP transport and the server tick loop

use crate::peers::PeerTable;
use crate::simulation::DemoSimulation;
use log::{debug, error, info, warn};
use shared::transport::datagram::{
    decode_packet, encode_packet, ControlPacket, HEARTBEAT_INTERVAL, HOST_PEER, MAX_DATAGRAM_SIZE,
    PEER_TIMEOUT, PROTOCOL_VERSION,
};
use shared::world::MirrorWorld;
use shared::{
    ConnectionEvent, Framing, PeerId, Reliability, ReplicationConfig, Replicator, Transport,
    TransportError,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

/// Non-blocking UDP transport accepting client handshakes
///
/// The socket is a tokio socket driven with `try_recv_from`/`try_send_to`,
/// so polling never awaits; readiness is picked up whenever the runtime
/// parks between ticks. Every datagram is a bincode [`ControlPacket`]. Replication bytes travel in
/// `Data` packets, one datagram per sender frame, so the transport reports
/// [`Framing::Datagram`]. Both reliability tiers are best effort.
pub struct UdpHostTransport {
    socket: UdpSocket,
    peers: PeerTable,
    events: Vec<ConnectionEvent>,
    inbound: Vec<(PeerId, Vec<u8>)>,
    last_heartbeat: Instant,
    buffer: Vec<u8>,
}

impl UdpHostTransport {
    pub async fn bind(addr: &str, max_peers: usize) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.writable().await?;
        info!("Host listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peers: PeerTable::new(max_peers),
            events: Vec::new(),
            inbound: Vec::new(),
            last_heartbeat: Instant::now(),
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Say goodbye to every peer
    pub fn shutdown(&mut self) {
        for (id, addr) in self.peers.addrs() {
            self.send_control(&ControlPacket::Goodbye, addr);
            self.peers.remove_peer(id);
            self.events.push(ConnectionEvent::Disconnected(id));
        }
    }

    /// Drain the socket, then run liveness bookkeeping
    fn pump(&mut self) {
        let now = Instant::now();

        loop {
            match self.socket.try_recv_from(&mut self.buffer) {
                Ok((len, addr)) => match decode_packet(&self.buffer[..len]) {
                    Some(packet) => self.handle_packet(packet, addr, now),
                    None => warn!("Dropping malformed datagram ({} bytes) from {}", len, addr),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    break;
                }
            }
        }

        for peer in self.peers.check_timeouts(now, PEER_TIMEOUT) {
            info!("Peer {} at {} timed out", peer.id, peer.addr);
            self.events.push(ConnectionEvent::Disconnected(peer.id));
        }

        if now.saturating_duration_since(self.last_heartbeat) >= HEARTBEAT_INTERVAL {
            self.last_heartbeat = now;
            for (_, addr) in self.peers.addrs() {
                self.send_control(&ControlPacket::Heartbeat, addr);
            }
        }
    }

    fn handle_packet(&mut self, packet: ControlPacket, addr: SocketAddr, now: Instant) {
        match packet {
            ControlPacket::Hello { protocol_version } => {
                info!(
                    "Peer connecting from {} (protocol version: {})",
                    addr, protocol_version
                );

                if protocol_version != PROTOCOL_VERSION {
                    let reason = format!(
                        "Protocol version {} not supported (host speaks {})",
                        protocol_version, PROTOCOL_VERSION
                    );
                    self.send_control(&ControlPacket::Refused { reason }, addr);
                    return;
                }

                if let Some(existing) = self.peers.find_by_addr(addr) {
                    info!("Removing existing peer {} from {}", existing, addr);
                    self.peers.remove_peer(existing);
                    self.events.push(ConnectionEvent::Disconnected(existing));
                }

                match self.peers.add_peer(addr, now) {
                    Some(peer_id) => {
                        info!("Peer {} connected from {}", peer_id, addr);
                        self.send_control(&ControlPacket::Welcome { peer_id }, addr);
                        self.events.push(ConnectionEvent::Connected(peer_id));
                    }
                    None => {
                        warn!("Refusing {}: host full", addr);
                        let reason = "Host full".to_string();
                        self.send_control(&ControlPacket::Refused { reason }, addr);
                    }
                }
            }

            ControlPacket::Heartbeat => {
                if let Some(id) = self.peers.find_by_addr(addr) {
                    self.peers.touch(id, now);
                }
            }

            ControlPacket::Goodbye => {
                if let Some(id) = self.peers.find_by_addr(addr) {
                    info!("Peer {} left", id);
                    self.peers.remove_peer(id);
                    self.events.push(ConnectionEvent::Disconnected(id));
                }
            }

            ControlPacket::Data { payload } => match self.peers.find_by_addr(addr) {
                Some(id) => {
                    self.peers.touch(id, now);
                    self.inbound.push((id, payload));
                }
                None => debug!("Dropping data from unknown address {}", addr),
            },

            ControlPacket::Welcome { .. } | ControlPacket::Refused { .. } => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    fn send_control(&self, packet: &ControlPacket, addr: SocketAddr) {
        let result = encode_packet(packet)
            .and_then(|bytes| self.socket.try_send_to(&bytes, addr).map_err(TransportError::from));
        if let Err(e) = result {
            error!("Failed to send control packet to {}: {}", addr, e);
        }
    }
}

impl Transport for UdpHostTransport {
    fn framing(&self) -> Framing {
        Framing::Datagram
    }

    fn local_peer(&self) -> Option<PeerId> {
        Some(HOST_PEER)
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
        let addr = self.peers.addr_of(peer).ok_or(TransportError::UnknownPeer(peer))?;
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
        self.socket.try_send_to(&datagram, addr)?;
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(removed) = self.peers.remove_peer(peer) {
            self.send_control(&ControlPacket::Goodbye, removed.addr);
            self.events.push(ConnectionEvent::Disconnected(peer));
        }
    }
}

/// Host process: the replicator, the canonical world and the simulation
pub struct Server {
    replicator: Replicator<UdpHostTransport>,
    world: MirrorWorld,
    simulation: DemoSimulation,
    tick_duration: Duration,
    tick: u64,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        max_peers: usize,
        config: ReplicationConfig,
        simulation: DemoSimulation,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = UdpHostTransport::bind(addr, max_peers).await?;
        let mut replicator = Replicator::new(transport, config)?;
        replicator.start_host()?;

        Ok(Server {
            replicator,
            world: MirrorWorld::new(),
            simulation,
            tick_duration,
            tick: 0,
        })
    }

    pub fn replicator(&self) -> &Replicator<UdpHostTransport> {
        &self.replicator
    }

    pub fn world(&self) -> &MirrorWorld {
        &self.world
    }

    /// One simulation step followed by one replication tick
    pub fn step(&mut self, now: Instant) {
        self.tick += 1;
        if let Err(e) = self.simulation.step(&mut self.replicator, &mut self.world) {
            warn!("Simulation step {} could not replicate: {}", self.tick, e);
        }

        let report = self.replicator.tick(&mut self.world, now);
        for (peer, e) in &report.send_failures {
            debug!("Send to {} failed during tick {}: {}", peer, self.tick, e);
        }
        for peer in self.replicator.persistent_violators() {
            warn!("Disconnecting {}: repeated authority violations", peer);
            self.replicator.transport_mut().disconnect(peer);
        }

        // Periodic performance monitoring
        if self.tick % 60 == 0 && !self.replicator.peers().is_empty() {
            let stats = self.replicator.stats();
            debug!(
                "Tick {}: {} peers, {} entities, {} received, {} applied, {} rebroadcast",
                self.tick,
                self.replicator.peers().len(),
                self.world.entity_count(),
                stats.received,
                stats.applied,
                stats.rebroadcast
            );
        }
        self.world.drain_events();
    }

    /// Main host loop; returns on ctrl-c
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Host started successfully");

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.step(Instant::now());
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Host shutting down");
                    break;
                }
            }
        }

        self.replicator.transport_mut().shutdown();
        self.replicator.tick(&mut self.world, Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    async fn send_raw(socket: &UdpSocket, packet: &ControlPacket, to: SocketAddr) {
        socket
            .send_to(&encode_packet(packet).unwrap(), to)
            .await
            .unwrap();
    }

    async fn recv_raw(socket: &UdpSocket) -> ControlPacket {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        decode_packet(&buf[..len]).unwrap()
    }

    async fn raw_client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    /// Poll until at least one event arrives or the deadline passes
    async fn wait_for_events(host: &mut UdpHostTransport) -> Vec<ConnectionEvent> {
        for _ in 0..100 {
            let events = host.poll_events();
            if !events.is_empty() {
                return events;
            }
            sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    /// Keep polling for a while so the host can answer
    async fn settle(host: &mut UdpHostTransport) {
        for _ in 0..20 {
            host.poll_events();
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn hello() -> ControlPacket {
        ControlPacket::Hello {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    #[tokio::test]
    async fn test_handshake_assigns_peer_id() {
        let mut host = UdpHostTransport::bind("127.0.0.1:0", 4).await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let client = raw_client().await;

        send_raw(&client, &hello(), host_addr).await;

        let events = wait_for_events(&mut host).await;
        assert_eq!(events, vec![ConnectionEvent::Connected(PeerId(1))]);
        assert_eq!(
            recv_raw(&client).await,
            ControlPacket::Welcome { peer_id: PeerId(1) }
        );
        assert_eq!(host.peer_count(), 1);
        assert_eq!(host.local_peer(), Some(HOST_PEER));
    }

    #[tokio::test]
    async fn test_version_mismatch_refused() {
        let mut host = UdpHostTransport::bind("127.0.0.1:0", 4).await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let client = raw_client().await;

        send_raw(
            &client,
            &ControlPacket::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
            },
            host_addr,
        )
        .await;
        settle(&mut host).await;

        assert!(matches!(
            recv_raw(&client).await,
            ControlPacket::Refused { .. }
        ));
        assert_eq!(host.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_host_full_refused() {
        let mut host = UdpHostTransport::bind("127.0.0.1:0", 1).await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let first = raw_client().await;
        let second = raw_client().await;

        send_raw(&first, &hello(), host_addr).await;
        assert_eq!(wait_for_events(&mut host).await.len(), 1);
        send_raw(&second, &hello(), host_addr).await;
        settle(&mut host).await;

        assert_eq!(
            recv_raw(&second).await,
            ControlPacket::Refused {
                reason: "Host full".to_string()
            }
        );
        assert_eq!(host.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_data_and_goodbye() {
        let mut host = UdpHostTransport::bind("127.0.0.1:0", 4).await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let client = raw_client().await;

        send_raw(&client, &hello(), host_addr).await;
        wait_for_events(&mut host).await;
        let _welcome = recv_raw(&client).await;

        send_raw(
            &client,
            &ControlPacket::Data {
                payload: vec![7, 7, 7],
            },
            host_addr,
        )
        .await;
        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(host.poll());
            if !received.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received, vec![(PeerId(1), vec![7, 7, 7])]);

        host.send(PeerId(1), &[1, 2], Reliability::Reliable).unwrap();
        assert_eq!(
            recv_raw(&client).await,
            ControlPacket::Data {
                payload: vec![1, 2]
            }
        );

        send_raw(&client, &ControlPacket::Goodbye, host_addr).await;
        assert_eq!(
            wait_for_events(&mut host).await,
            vec![ConnectionEvent::Disconnected(PeerId(1))]
        );
        assert!(matches!(
            host.send(PeerId(1), &[1], Reliability::Reliable),
            Err(TransportError::UnknownPeer(PeerId(1)))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_sends_goodbye() {
        let mut host = UdpHostTransport::bind("127.0.0.1:0", 4).await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let client = raw_client().await;

        send_raw(&client, &hello(), host_addr).await;
        wait_for_events(&mut host).await;
        let _welcome = recv_raw(&client).await;

        host.disconnect(PeerId(1));
        assert_eq!(recv_raw(&client).await, ControlPacket::Goodbye);
        assert_eq!(
            host.poll_events(),
            vec![ConnectionEvent::Disconnected(PeerId(1))]
        );
    }

    #[tokio::test]
    async fn test_server_step_starts_hosting() {
        let mut server = Server::new(
            "127.0.0.1:0",
            Duration::from_millis(16),
            4,
            ReplicationConfig::default(),
            DemoSimulation::new(7),
        )
        .await
        .unwrap();

        for _ in 0..10 {
            server.step(Instant::now());
        }
        assert!(server.replicator().session().is_host());
        assert!(server.replicator().peers().is_empty());
    }
}
