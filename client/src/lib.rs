//! # Replication Client
//!
//! This library provides the mirroring side of a replicated session. A client
//! never computes simulation results; it applies what the host sends to a
//! local mirror of the world and shares its own player actions.
//!
//! ## Architecture Overview
//!
//! ### Mirroring
//! Entity spawns, effect toggles, operational changes and cell updates
//! arrive from the host and are applied through the shared dispatch
//! pipeline. Messages that only the host may apply are rejected here, and
//! anything that does not come from the host is dropped.
//!
//! ### Player Actions
//! Digging, building and cursor movement are applied locally right away and
//! sent to the host, which forwards them to every other client. The host
//! never echoes an action back to the client that performed it.
//!
//! ### Late Join
//! Right after the handshake the client asks the host for a full sync so
//! that entities spawned before it joined are mirrored too.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - [`network::UdpClientTransport`], a non-blocking UDP link to one host
//!   with hello/welcome handshake, heartbeats and timeout detection
//! - [`network::Client`], which owns the replicator and the mirror and runs
//!   the tick loop
//!
//! ### Actions Module (`actions`)
//! A fixed schedule of player actions standing in for keyboard input.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::actions::{ActionScript, ActionSettings};
//! use client::network::Client;
//! use shared::ReplicationConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new(
//!         "127.0.0.1:8080",
//!         Duration::from_millis(33),
//!         ReplicationConfig::default(),
//!         ActionScript::new(ActionSettings::default()),
//!     )
//!     .await?;
//!
//!     // Runs until the host goes away or ctrl-c
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod network;
