//! Shared type definitions for the Arena trainer.
//!
//! Every crate in the workspace speaks these types: the session loop, the
//! visualization endpoint, the reference agent, and recording readers.
//!
//! # Modules
//!
//! - [`ids`] -- Session, agent, and tick identifiers
//! - [`enums`] -- Connection states, session phases, session results
//! - [`structs`] -- Snapshots, agent inputs, agent views
//! - [`wire`] -- Line-delimited JSON messages exchanged with agents
//! - [`recording`] -- Entries of a recording file

pub mod enums;
pub mod ids;
pub mod recording;
pub mod structs;
pub mod wire;

// Re-export all public types at crate root for convenience.
pub use enums::{AgentConnectionState, CommDirection, SessionPhase, SessionResult};
pub use ids::{AgentIndex, SessionId, Tick};
pub use recording::RecordEntry;
pub use structs::{AgentInput, AgentView, Snapshot, TickInputs};
pub use wire::{AgentMessage, ServerMessage};
