//! # Replication Host
//!
//! This library provides the authoritative side of a replicated session. The
//! host owns the canonical world, allocates network identities for every
//! replicated entity and is the hub every client message passes through.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The host runs the only copy of the simulation that computes results.
//! Clients receive state-change messages and mirror them; they never
//! recompute outcomes.
//!
//! ### Peer Management
//! Handles the lifecycle of client connections:
//! - Handshake with protocol version check and peer id assignment
//! - Capacity limits ("Host full" refusals)
//! - Heartbeats and timeout detection
//! - Disconnecting peers that keep violating message authority
//!
//! ### Fan-Out
//! Clients only ever talk to the host. Player actions a client sends are
//! applied here and forwarded to every other client, never echoed back to
//! the client that performed them.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick Loop
//! A tokio interval drives the loop. Each tick runs one simulation step and
//! then one replication tick: connection events, inbound dispatch, bulk
//! batch flush and outbound send, in that order. Nothing in a tick awaits.
//!
//! ### UDP Transport
//! A non-blocking UDP socket is drained on every poll. Each datagram carries
//! a small control envelope (hello, welcome, heartbeat, goodbye or data),
//! and each data payload holds whole codec frames.
//!
//! ## Module Organization
//!
//! ### Peers Module (`peers`)
//! Connected peer roster:
//! - Peer id assignment starting at 1
//! - Address lookup and liveness timestamps
//! - Timeout sweeps
//!
//! ### Network Module (`network`)
//! - [`network::UdpHostTransport`], the socket-backed `Transport`
//! - [`network::Server`], which owns the replicator, world and simulation
//!   and runs the tick loop until ctrl-c
//!
//! ### Simulation Module (`simulation`)
//! A seeded stand-in for the real colony simulation that spawns entities,
//! toggles effects and updates cells, reporting each change for replication.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use host::network::Server;
//! use host::simulation::DemoSimulation;
//! use shared::ReplicationConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         Duration::from_millis(33), // 30Hz
//!         16,
//!         ReplicationConfig::default(),
//!         DemoSimulation::new(42),
//!     )
//!     .await?;
//!
//!     // Runs until ctrl-c, then says goodbye to every peer
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod peers;
pub mod simulation;
