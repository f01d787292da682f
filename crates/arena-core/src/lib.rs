//! Tick clock, agent connections, recording, and the session loop for the
//! Arena trainer.
//!
//! This crate owns the fixed-rate session that coordinates remote agents:
//! every tick it collects one input per agent, advances the simulation,
//! records the snapshot, and offers it to viewers.
//!
//! # Modules
//!
//! - [`agents`] -- Agent Connection Manager: connect, handshake, per-tick
//!   input collection, miss accounting.
//! - [`clock`] -- Absolute-origin tick clock with overrun counting.
//! - [`config`] -- Session configuration from `arena-trainer.yaml`.
//! - [`connector`] -- [`Connector`] trait and [`TcpConnector`].
//! - [`diagnostics`] -- Raw agent communication capture.
//! - [`operator`] -- External abort signal.
//! - [`publisher`] -- Latest-wins visualization publisher.
//! - [`recorder`] -- JSON Lines session recording.
//! - [`session`] -- The session state machine and tick loop.
//! - [`simulation`] -- [`Simulation`] and [`MapLoader`] seams, built-in maps.
//! - [`status`] -- Live session status.
//!
//! [`Connector`]: connector::Connector
//! [`TcpConnector`]: connector::TcpConnector
//! [`Simulation`]: simulation::Simulation
//! [`MapLoader`]: simulation::MapLoader

pub mod agents;
pub mod clock;
pub mod config;
pub mod connector;
pub mod diagnostics;
pub mod operator;
pub mod publisher;
pub mod recorder;
pub mod session;
pub mod simulation;
pub mod status;
