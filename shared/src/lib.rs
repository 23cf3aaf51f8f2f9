//! # Replication Core
//!
//! This library is the entity-replication and packet-dispatch layer shared
//! by the host and client binaries. One peer, the host, runs the canonical
//! simulation; clients receive a stream of typed state-change messages and
//! apply them to a local mirror without computing results themselves.
//!
//! ## Architecture Overview
//!
//! Data flows through the same stages on every peer:
//!
//! ```text
//! simulation change -> Sender / BatchQueue -> codec -> Transport
//!        remote Transport -> DispatchPipeline -> codec -> Message::apply
//! ```
//!
//! Everything runs on the tick thread and nothing blocks. The only state
//! shared across threads is the [`batching::BatchQueue`], which is guarded by
//! a mutex so that worker threads can queue bulk updates.
//!
//! ## Module Organization
//!
//! ### Wire Codec (`codec`)
//! Frames are `[u16 kind][u32 payload length][payload]`, little-endian.
//! Unknown kinds can be stepped over because the length is always known.
//!
//! ### Messages and Catalog (`messages`, `catalog`)
//! Each message kind is a struct implementing [`messages::Replicated`],
//! declaring who may apply it, its reliability tier, whether the host
//! rebroadcasts it and whether it is batched. The catalog maps wire tags to
//! those declarations and is immutable once built.
//!
//! ### Identity (`identity`)
//! Host-allocated [`identity::NetId`]s name entities across peers. The
//! registry maps them to generational arena keys and never owns entities.
//!
//! ### Dispatch, Sender and Batching (`dispatch`, `sender`, `batching`)
//! Inbound frames are decoded, checked against the session role, applied and
//! (on the host) forwarded to every other peer. Outbound messages are
//! addressed by role: a client only ever talks to its host. Bulk kinds are
//! coalesced into capped batches on a fixed interval.
//!
//! ### Session and Transport (`session`, `transport`)
//! The session role gates every send and every apply. Transports are
//! polled, never awaited; an in-memory transport ships with the crate.
//!
//! ### Replicator (`replicator`)
//! Owns all of the above for one endpoint and runs them in tick order.
//!
//! ## Usage Example
//!
//! ```rust
//! use shared::config::ReplicationConfig;
//! use shared::messages::ToggleEffect;
//! use shared::replicator::Replicator;
//! use shared::transport::memory::MemoryNetwork;
//! use shared::world::MirrorWorld;
//! use std::time::Instant;
//!
//! let network = MemoryNetwork::new();
//! let host_end = network.endpoint();
//! let client_end = network.endpoint();
//! let host_id = host_end.id();
//! network.connect(host_id, client_end.id());
//!
//! let mut host = Replicator::new(host_end, ReplicationConfig::default())?;
//! let mut client = Replicator::new(client_end, ReplicationConfig::default())?;
//! host.start_host()?;
//! client.join(host_id)?;
//!
//! let (mut host_world, mut client_world) = (MirrorWorld::new(), MirrorWorld::new());
//! host.tick(&mut host_world, Instant::now());
//!
//! let (_, id) = host.spawn_replicated(&mut host_world, "Duplicant", 12)?;
//! host.replicate(ToggleEffect { target: id, adding: true, effect: "Overjoyed".into() })?;
//! host.tick(&mut host_world, Instant::now());
//! client.tick(&mut client_world, Instant::now());
//!
//! let mirrored = client.registry().resolve(id).unwrap();
//! assert!(client_world.has_effect(mirrored, "Overjoyed"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod batching;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod messages;
pub mod replicator;
pub mod sender;
pub mod session;
pub mod transport;
pub mod world;

pub use catalog::MessageCatalog;
pub use config::ReplicationConfig;
pub use error::{
    ApplyError, CodecError, ConfigurationError, IdentityError, SendError, SessionError,
    TransportError,
};
pub use identity::{IdentityRegistry, NetId};
pub use messages::{Message, MessageKind};
pub use replicator::{Replicator, TickReport};
pub use session::{Session, SessionRole};
pub use transport::{ConnectionEvent, Framing, PeerId, Reliability, Transport};
