//! Core per-tick structs: snapshots, agent inputs, agent views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::enums::AgentConnectionState;
use crate::ids::{AgentIndex, Tick};

/// A point-in-time serializable view of the simulation at a tick.
///
/// The `state` payload is opaque to the orchestrator; it is produced by the
/// simulation and consumed by the recorder and the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The tick this snapshot was taken after.
    pub tick: Tick,
    /// Identifier of the map being played.
    pub map: String,
    /// Simulation-defined state payload.
    pub state: serde_json::Value,
}

/// What an agent contributed for a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum AgentInput {
    /// The agent answered in time with this payload.
    Received(serde_json::Value),
    /// The agent did not answer in time (or the exchange failed).
    Missing,
}

impl AgentInput {
    /// Return the payload if one was received.
    pub const fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Received(value) => Some(value),
            Self::Missing => None,
        }
    }

    /// Whether the agent missed this tick.
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Inputs collected for one tick, keyed by agent index.
///
/// Only agents that were live when collection started appear here.
pub type TickInputs = BTreeMap<AgentIndex, AgentInput>;

/// Read-only view of an agent handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentView {
    /// Stable arena index.
    pub index: AgentIndex,
    /// Human-readable label (the target, then the name the agent announced).
    pub label: String,
    /// Current connection state.
    pub state: AgentConnectionState,
    /// Last tick the agent answered, if any.
    pub last_seen: Option<Tick>,
    /// Number of consecutive ticks missed.
    pub consecutive_misses: u32,
}
