//! Integration tests for the replication layer
//!
//! These tests validate cross-component interactions over the in-memory
//! network and over real loopback UDP.

use shared::batching::BulkPolicy;
use shared::codec;
use shared::messages::{CellUpdate, DigAction, EntitySpawn, ToggleEffect};
use shared::transport::memory::{MemoryNetwork, MemoryTransport};
use shared::world::{MirrorWorld, SimWorld, WorldEvent};
use shared::error::SendError;
use shared::{Message, MessageKind, NetId, ReplicationConfig, Replicator, SessionRole};
use std::time::{Duration, Instant};

/// A host and `clients` clients, all linked to the host only
fn star(
    clients: usize,
    client_config: ReplicationConfig,
) -> (
    MemoryNetwork,
    Replicator<MemoryTransport>,
    Vec<Replicator<MemoryTransport>>,
) {
    let network = MemoryNetwork::new();
    let mut host = Replicator::new(network.endpoint(), ReplicationConfig::default()).unwrap();
    host.start_host().unwrap();
    let host_id = host.transport().id();

    let clients = (0..clients)
        .map(|_| {
            let mut client = Replicator::new(network.endpoint(), client_config.clone()).unwrap();
            network.connect(host_id, client.transport().id());
            client.join(host_id).unwrap();
            client
        })
        .collect();

    (network, host, clients)
}

fn effect_changes(world: &MirrorWorld, effect: &str) -> usize {
    world
        .events()
        .iter()
        .filter(|e| matches!(e, WorldEvent::EffectChanged { effect: name, .. } if name == effect))
        .count()
}

/// REPLICATION SCENARIO TESTS
mod scenario_tests {
    use super::*;

    /// Host registers an entity, toggles "Overjoyed" on it, the client
    /// mirrors the effect exactly once
    #[test]
    fn overjoyed_effect_replicates_once() {
        let (_network, mut host, mut clients) = star(1, ReplicationConfig::default());
        let client = &mut clients[0];
        let (mut host_world, mut client_world) = (MirrorWorld::new(), MirrorWorld::new());
        let now = Instant::now();
        host.tick(&mut host_world, now);
        client.tick(&mut client_world, now);

        let (_, id) = host
            .spawn_replicated(&mut host_world, "Duplicant", 100)
            .unwrap();
        assert_eq!(id, NetId(1));

        host.replicate(ToggleEffect {
            target: id,
            adding: true,
            effect: "Overjoyed".to_string(),
        })
        .unwrap();
        host.tick(&mut host_world, now);
        client.tick(&mut client_world, now);

        let entity = client.registry().resolve(NetId(1)).unwrap();
        assert!(client_world.has_effect(entity, "Overjoyed"));
        assert_eq!(effect_changes(&client_world, "Overjoyed"), 1);
        assert_eq!(client.registry().resolve(NetId(1)), Some(entity));
        assert_eq!(client.stats().applied, 2);
    }

    /// Client A digs cell 42; the host applies it and forwards it to B only
    #[test]
    fn dig_action_forwarded_to_other_clients_only() {
        let (_network, mut host, mut clients) = star(2, ReplicationConfig::default());
        let mut host_world = MirrorWorld::new();
        let mut worlds = vec![MirrorWorld::new(), MirrorWorld::new()];
        let now = Instant::now();
        host.tick(&mut host_world, now);
        for (client, world) in clients.iter_mut().zip(worlds.iter_mut()) {
            client.tick(world, now);
        }
        let a_id = clients[0].transport().id();

        clients[0]
            .perform_action(&mut worlds[0], DigAction { cell: 42, ..DigAction::default() })
            .unwrap();
        clients[0].tick(&mut worlds[0], now);
        host.tick(&mut host_world, now);
        for (client, world) in clients.iter_mut().zip(worlds.iter_mut()) {
            client.tick(world, now);
        }

        assert_eq!(host_world.dig_count(42), 1);
        assert_eq!(worlds[0].dig_count(42), 1);
        assert_eq!(worlds[1].dig_count(42), 1);
        assert_eq!(host.stats().rebroadcast, 1);

        // A never hears its own action back
        assert_eq!(clients[0].stats().received, 0);
        assert_eq!(clients[1].stats().received, 1);

        // B sees A as the origin, whatever A wrote into the field
        assert!(worlds[1]
            .events()
            .iter()
            .any(|e| *e == WorldEvent::Dug { cell: 42, origin: a_id }));
    }

    /// Actions performed by the host reach every client
    #[test]
    fn host_action_reaches_all_clients() {
        let (_network, mut host, mut clients) = star(3, ReplicationConfig::default());
        let mut host_world = MirrorWorld::new();
        let mut worlds: Vec<MirrorWorld> = (0..3).map(|_| MirrorWorld::new()).collect();
        let now = Instant::now();
        host.tick(&mut host_world, now);

        host.perform_action(&mut host_world, DigAction { cell: 7, ..DigAction::default() })
            .unwrap();
        host.tick(&mut host_world, now);
        for (client, world) in clients.iter_mut().zip(worlds.iter_mut()) {
            client.tick(world, now);
            assert_eq!(world.dig_count(7), 1);
        }
        assert_eq!(host_world.dig_count(7), 1);
    }

    /// A client that joins late catches up through a full sync
    #[test]
    fn late_joiner_full_sync() {
        let network = MemoryNetwork::new();
        let mut host = Replicator::new(network.endpoint(), ReplicationConfig::default()).unwrap();
        host.start_host().unwrap();
        let mut host_world = MirrorWorld::new();
        let now = Instant::now();

        let mut spawned = Vec::new();
        for (n, prefab) in ["Hatch", "Pacu", "Duplicant"].iter().enumerate() {
            spawned.push(host.spawn_replicated(&mut host_world, prefab, n as i32).unwrap());
        }
        host.tick(&mut host_world, now);

        let mut client = Replicator::new(network.endpoint(), ReplicationConfig::default()).unwrap();
        network.connect(host.transport().id(), client.transport().id());
        client.join(host.transport().id()).unwrap();
        let mut client_world = MirrorWorld::new();

        host.tick(&mut host_world, now);
        client.tick(&mut client_world, now);
        assert_eq!(client_world.entity_count(), 0);

        client.request_full_sync().unwrap();
        client.tick(&mut client_world, now);
        host.tick(&mut host_world, now);
        client.tick(&mut client_world, now);

        assert_eq!(client_world.entity_count(), 3);
        for (key, id) in spawned {
            let mirrored = client.registry().resolve(id).unwrap();
            assert_eq!(client_world.describe(mirrored), host_world.describe(key));
        }
    }
}

/// WIRE AND DISPATCH TESTS
mod dispatch_tests {
    use super::*;

    /// An unknown tag is skipped and the frame after it still applies
    #[test]
    fn unknown_tag_resilience() {
        let (network, host, mut clients) = star(1, ReplicationConfig::default());
        let client = &mut clients[0];
        let mut world = MirrorWorld::new();
        let host_id = host.transport().id();
        client.tick(&mut world, Instant::now());

        let mut stream = Vec::new();
        codec::write_frame(999, &[1, 2, 3, 4, 5], &mut stream).unwrap();
        let dig = codec::encode(&Message::from(DigAction { origin: host_id, cell: 3 })).unwrap();
        stream.extend_from_slice(&dig);
        network.inject(host_id, client.transport().id(), stream);

        let report = client.tick(&mut world, Instant::now());
        assert!(report.framing_errors.is_empty());
        assert_eq!(report.dispatch.processed, 2);
        assert_eq!(report.dispatch.applied, 1);
        assert_eq!(client.stats().unknown_kinds, 1);
        assert_eq!(world.dig_count(3), 1);
    }

    /// A datagram that ends mid-frame ends the connection
    #[test]
    fn truncated_datagram_is_fatal() {
        let (network, host, mut clients) = star(1, ReplicationConfig::default());
        let client = &mut clients[0];
        let mut world = MirrorWorld::new();
        let host_id = host.transport().id();
        client.tick(&mut world, Instant::now());

        let mut bytes = codec::encode(&Message::from(DigAction { origin: host_id, cell: 3 })).unwrap();
        bytes.truncate(bytes.len() - 2);
        network.inject(host_id, client.transport().id(), bytes);

        let report = client.tick(&mut world, Instant::now());
        assert_eq!(report.framing_errors, vec![host_id]);
        assert_eq!(world.dig_count(3), 0);
        assert!(client.peers().is_empty());
    }

    /// Clients may not apply host-only kinds and the host may not apply
    /// client-only kinds; repeat offenders are flagged
    #[test]
    fn authority_violations_are_dropped_and_flagged() {
        let (network, mut host, mut clients) = star(1, ReplicationConfig::default());
        let rogue = &mut clients[0];
        let mut host_world = MirrorWorld::new();
        let mut rogue_world = MirrorWorld::new();
        let now = Instant::now();
        host.tick(&mut host_world, now);
        rogue.tick(&mut rogue_world, now);

        let spawn = |n: u32| EntitySpawn {
            id: NetId(n + 1),
            prefab: "Slickster".to_string(),
            cell: 0,
        };

        // a well-behaved replicator refuses to send host state at all
        assert!(matches!(
            rogue.replicate(spawn(0)),
            Err(SendError::Unauthorized { .. })
        ));

        let rogue_id = rogue.transport().id();
        for n in 0..20 {
            let bytes = codec::encode(&Message::from(spawn(n))).unwrap();
            network.inject(rogue_id, host.transport().id(), bytes);
        }
        host.tick(&mut host_world, now);

        assert_eq!(host_world.entity_count(), 0);
        assert_eq!(host.stats().authority_violations, 20);
        assert_eq!(host.persistent_violators(), vec![rogue_id]);
    }

    /// The per-tick cap leaves the rest queued in arrival order
    #[test]
    fn per_poll_cap_defers_remaining() {
        let config = ReplicationConfig {
            max_messages_per_poll_client: 4,
            ..ReplicationConfig::default()
        };
        let (_network, mut host, mut clients) = star(1, config);
        let client = &mut clients[0];
        let mut host_world = MirrorWorld::new();
        let mut client_world = MirrorWorld::new();
        let now = Instant::now();
        host.tick(&mut host_world, now);

        for cell in 0..10 {
            host.perform_action(&mut host_world, DigAction { cell, ..DigAction::default() })
                .unwrap();
        }
        host.tick(&mut host_world, now);

        let first = client.tick(&mut client_world, now);
        assert_eq!(first.dispatch.processed, 4);
        assert_eq!(first.dispatch.remaining, 6);
        let second = client.tick(&mut client_world, now);
        assert_eq!(second.dispatch.processed, 4);
        let third = client.tick(&mut client_world, now);
        assert_eq!(third.dispatch.processed, 2);
        assert_eq!(third.dispatch.remaining, 0);

        let order: Vec<i32> = client_world
            .events()
            .iter()
            .filter_map(|e| match e {
                WorldEvent::Dug { cell, .. } => Some(*cell),
                _ => None,
            })
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }
}

/// BATCHING TESTS
mod batching_tests {
    use super::*;

    /// No batch exceeds the configured size, and the rest goes out later
    #[test]
    fn batch_cap_respected() {
        let mut config = ReplicationConfig::default();
        config.bulk.insert(
            "CellUpdate".to_string(),
            BulkPolicy {
                max_batch_size: 8,
                interval_ms: 100,
            },
        );
        let network = MemoryNetwork::new();
        let mut host = Replicator::new(network.endpoint(), config).unwrap();
        host.start_host().unwrap();
        let mut client = Replicator::new(network.endpoint(), ReplicationConfig::default()).unwrap();
        network.connect(host.transport().id(), client.transport().id());
        client.join(host.transport().id()).unwrap();

        let mut host_world = MirrorWorld::new();
        let mut client_world = MirrorWorld::new();
        let start = Instant::now();
        host.tick(&mut host_world, start);

        for cell in 0..20 {
            host.replicate(CellUpdate {
                cell,
                element: 4,
                mass: 500.0,
                temperature: 310.5,
            })
            .unwrap();
        }

        let mut cells_seen = Vec::new();
        for step in 1..=3u64 {
            let now = start + Duration::from_millis(100 * step);
            let report = host.tick(&mut host_world, now);
            assert_eq!(report.batches_flushed, 1);
            client.tick(&mut client_world, now);
            cells_seen.push(
                client_world
                    .drain_events()
                    .iter()
                    .filter(|e| matches!(e, WorldEvent::CellChanged(_)))
                    .count(),
            );
        }
        assert_eq!(cells_seen, vec![8, 8, 4]);
        assert_eq!(host.batch_queue().pending(MessageKind::CellUpdate), 0);

        let cell = client_world.cell(19).unwrap();
        assert_eq!(cell.element, 4);
        assert_approx_eq::assert_approx_eq!(cell.temperature, 310.5, 0.001);
    }

    /// Worker threads can queue bulk updates through a cloned handle
    #[test]
    fn batch_queue_from_worker_thread() {
        let (_network, mut host, mut clients) = star(1, ReplicationConfig::default());
        let client = &mut clients[0];
        let mut host_world = MirrorWorld::new();
        let mut client_world = MirrorWorld::new();
        let start = Instant::now();
        host.tick(&mut host_world, start);

        let queue = host.batch_queue();
        std::thread::spawn(move || {
            for cell in 0..10 {
                queue
                    .enqueue(Message::from(CellUpdate {
                        cell,
                        element: 1,
                        mass: 1.0,
                        temperature: 273.15,
                    }))
                    .unwrap();
            }
        })
        .join()
        .unwrap();

        let later = start + Duration::from_secs(1);
        host.tick(&mut host_world, later);
        client.tick(&mut client_world, later);
        assert!((0..10).all(|cell| client_world.cell(cell).is_some()));
    }
}

/// CONNECTION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Losing a client drops its queues but keeps the host's identities
    #[test]
    fn connection_loss_keeps_registry() {
        let (network, mut host, mut clients) = star(1, ReplicationConfig::default());
        let client = &mut clients[0];
        let mut host_world = MirrorWorld::new();
        let mut client_world = MirrorWorld::new();
        let now = Instant::now();
        host.tick(&mut host_world, now);

        let (_, id) = host.spawn_replicated(&mut host_world, "Hatch", 5).unwrap();
        host.tick(&mut host_world, now);
        client.tick(&mut client_world, now);
        let mirrored = client.registry().resolve(id).unwrap();

        network.sever(host.transport().id(), client.transport().id());
        let host_report = host.tick(&mut host_world, now);
        let client_report = client.tick(&mut client_world, now);

        assert_eq!(host_report.disconnected, vec![client.transport().id()]);
        assert!(host.peers().is_empty());
        assert!(host.registry().resolve(id).is_some());

        assert_eq!(client_report.disconnected, vec![host.transport().id()]);
        assert_eq!(client.role(), SessionRole::NotInSession);
        assert_eq!(client.registry().resolve(id), Some(mirrored));
    }

    /// Nothing is sent or applied outside a session
    #[test]
    fn idle_endpoint_ignores_traffic() {
        let network = MemoryNetwork::new();
        let sender = network.endpoint();
        let mut idle = Replicator::new(network.endpoint(), ReplicationConfig::default()).unwrap();
        let bytes = codec::encode(&Message::from(DigAction::default())).unwrap();
        network.inject(sender.id(), idle.transport().id(), bytes);

        let mut world = MirrorWorld::new();
        let report = idle.tick(&mut world, Instant::now());
        assert_eq!(report.dispatch.processed, 0);
        assert_eq!(world.dig_count(0), 0);
        assert!(idle.replicate(DigAction::default()).is_err());
    }
}

/// REAL NETWORK TESTS
mod udp_tests {
    use super::*;
    use client::network::UdpClientTransport;
    use host::network::UdpHostTransport;
    use shared::transport::datagram::HOST_PEER;
    use shared::Transport;
    use tokio::time::sleep;

    /// Host and client replicate over loopback UDP in both directions
    #[tokio::test]
    async fn udp_host_client_roundtrip() {
        let host_transport = UdpHostTransport::bind("127.0.0.1:0", 4).await.unwrap();
        let host_addr = host_transport.local_addr().unwrap();
        let mut host = Replicator::new(host_transport, ReplicationConfig::default()).unwrap();
        host.start_host().unwrap();

        let client_transport = UdpClientTransport::connect(&host_addr.to_string())
            .await
            .unwrap();
        let mut client = Replicator::new(client_transport, ReplicationConfig::default()).unwrap();
        client.join(HOST_PEER).unwrap();

        let mut host_world = MirrorWorld::new();
        let mut client_world = MirrorWorld::new();

        for _ in 0..200 {
            host.tick(&mut host_world, Instant::now());
            client.tick(&mut client_world, Instant::now());
            if !host.peers().is_empty() && client.transport().is_connected() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.peers().len(), 1);
        let client_peer = client.transport().local_peer().unwrap();
        assert_eq!(host.peers(), vec![client_peer]);

        let (_, id) = host
            .spawn_replicated(&mut host_world, "Duplicant", 12)
            .unwrap();
        host.replicate(ToggleEffect {
            target: id,
            adding: true,
            effect: "Overjoyed".to_string(),
        })
        .unwrap();

        let mut mirrored = None;
        for _ in 0..200 {
            host.tick(&mut host_world, Instant::now());
            client.tick(&mut client_world, Instant::now());
            mirrored = client.registry().resolve(id);
            if mirrored.is_some_and(|e| client_world.has_effect(e, "Overjoyed")) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(client_world.has_effect(mirrored.unwrap(), "Overjoyed"));

        client
            .perform_action(&mut client_world, DigAction { cell: 42, ..DigAction::default() })
            .unwrap();
        for _ in 0..200 {
            client.tick(&mut client_world, Instant::now());
            host.tick(&mut host_world, Instant::now());
            if host_world.dig_count(42) == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host_world.dig_count(42), 1);
        assert!(host_world
            .events()
            .iter()
            .any(|e| *e == WorldEvent::Dug { cell: 42, origin: client_peer }));
    }
}
