//! Simulation and map-loading seams.
//!
//! The orchestrator does not know any game rules. Each tick it hands the
//! collected agent inputs to a [`Simulation`], which advances its own state
//! and reports whether the game has concluded. A [`MapLoader`] builds the
//! initial simulation for a map identifier.
//!
//! [`IdleSimulation`] and [`BuiltinMaps`] let a session run end-to-end
//! without a rules engine: the simulation only tracks what agents sent.

use std::collections::BTreeMap;

use arena_types::{AgentIndex, Snapshot, Tick, TickInputs};
use serde_json::json;

/// Errors raised by a simulation while advancing.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// Ticks were not advanced in order.
    #[error("tick {got} advanced out of order (expected {expected})")]
    OutOfOrder {
        /// The tick the simulation expected next.
        expected: Tick,
        /// The tick it was asked to advance.
        got: Tick,
    },

    /// An internal error in the rules implementation.
    #[error("simulation error: {message}")]
    Internal {
        /// Description of the error.
        message: String,
    },
}

/// Errors raised while loading a map.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// No map with that identifier is available.
    #[error("unknown map {map:?} (available: {available})")]
    Unknown {
        /// The requested map.
        map: String,
        /// Comma-separated list of known maps.
        available: String,
    },

    /// The map exists but cannot host this many agents.
    #[error("map {map:?} supports at most {max} agents, {requested} configured")]
    TooManyAgents {
        /// The requested map.
        map: String,
        /// Maximum agents the map supports.
        max: usize,
        /// Agents configured for the session.
        requested: usize,
    },
}

/// What the simulation reports after advancing a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Keep ticking.
    Continue,
    /// The game is over.
    Concluded {
        /// Human-readable summary of the outcome.
        summary: String,
    },
}

/// Game rules plugged into the session loop.
///
/// The session calls [`advance`](Simulation::advance) exactly once per tick,
/// with inputs collected for that same tick, and never concurrently.
/// [`observe`](Simulation::observe) is called while inputs are collected.
pub trait Simulation: Send + Sync {
    /// Observation sent to an agent when requesting its input for `tick`.
    fn observe(&self, agent: AgentIndex, tick: Tick) -> serde_json::Value;

    /// Advance the state by one tick.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the state cannot be advanced; the
    /// session aborts in that case.
    fn advance(&mut self, tick: Tick, inputs: &TickInputs) -> Result<Progress, SimulationError>;

    /// Serializable view of the state after `tick` advanced.
    fn snapshot(&self, tick: Tick) -> Snapshot;
}

/// Builds the initial simulation for a map identifier.
pub trait MapLoader: Send + Sync {
    /// Load `map` for a session with `agents` configured agents.
    ///
    /// # Errors
    ///
    /// Returns [`MapError`] if the map is unknown or unsuitable.
    fn load(&self, map: &str, agents: usize) -> Result<Box<dyn Simulation>, MapError>;
}

/// A simulation with no rules: it records the latest input of every agent
/// and, optionally, concludes after a fixed number of ticks.
#[derive(Debug, Clone)]
pub struct IdleSimulation {
    map: String,
    next: Tick,
    conclude_after: Option<Tick>,
    latest: BTreeMap<AgentIndex, serde_json::Value>,
    inputs_received: u64,
    inputs_missing: u64,
}

impl IdleSimulation {
    /// Create an idle simulation for `map` that never concludes.
    pub fn new(map: &str) -> Self {
        Self {
            map: map.to_owned(),
            next: Tick::ZERO,
            conclude_after: None,
            latest: BTreeMap::new(),
            inputs_received: 0,
            inputs_missing: 0,
        }
    }

    /// Conclude the game once `tick` has advanced.
    #[must_use]
    pub const fn concluding_after(mut self, tick: Tick) -> Self {
        self.conclude_after = Some(tick);
        self
    }

    /// Total inputs received so far.
    pub const fn inputs_received(&self) -> u64 {
        self.inputs_received
    }

    /// Total missing inputs so far.
    pub const fn inputs_missing(&self) -> u64 {
        self.inputs_missing
    }
}

impl Simulation for IdleSimulation {
    fn observe(&self, agent: AgentIndex, tick: Tick) -> serde_json::Value {
        json!({
            "tick": tick,
            "map": self.map,
            "you": agent,
            "last_input": self.latest.get(&agent),
        })
    }

    fn advance(&mut self, tick: Tick, inputs: &TickInputs) -> Result<Progress, SimulationError> {
        if tick != self.next {
            return Err(SimulationError::OutOfOrder {
                expected: self.next,
                got: tick,
            });
        }

        for (agent, input) in inputs {
            match input.payload() {
                Some(payload) => {
                    self.latest.insert(*agent, payload.clone());
                    self.inputs_received = self.inputs_received.saturating_add(1);
                }
                None => {
                    self.inputs_missing = self.inputs_missing.saturating_add(1);
                }
            }
        }

        self.next = tick.next().ok_or_else(|| SimulationError::Internal {
            message: "tick counter exhausted".to_owned(),
        })?;

        match self.conclude_after {
            Some(last) if tick >= last => Ok(Progress::Concluded {
                summary: format!("idle game over after tick {tick}"),
            }),
            _ => Ok(Progress::Continue),
        }
    }

    fn snapshot(&self, tick: Tick) -> Snapshot {
        Snapshot {
            tick,
            map: self.map.clone(),
            state: json!({
                "agents": self.latest,
                "inputs_received": self.inputs_received,
                "inputs_missing": self.inputs_missing,
            }),
        }
    }
}

/// Maps bundled with the trainer, each hosting an [`IdleSimulation`].
#[derive(Debug, Clone, Default)]
pub struct BuiltinMaps;

impl BuiltinMaps {
    /// Known map identifiers and their agent capacity.
    const MAPS: [(&'static str, usize); 2] = [("hexagon", 8), ("deathmatch", 16)];

    /// Create the built-in loader.
    pub const fn new() -> Self {
        Self
    }
}

impl MapLoader for BuiltinMaps {
    fn load(&self, map: &str, agents: usize) -> Result<Box<dyn Simulation>, MapError> {
        let Some(&(_, max)) = Self::MAPS.iter().find(|(name, _)| *name == map) else {
            return Err(MapError::Unknown {
                map: map.to_owned(),
                available: Self::MAPS
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        };
        if agents > max {
            return Err(MapError::TooManyAgents {
                map: map.to_owned(),
                max,
                requested: agents,
            });
        }
        Ok(Box::new(IdleSimulation::new(map)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use arena_types::AgentInput;

    use super::*;

    fn inputs(pairs: &[(u32, Option<serde_json::Value>)]) -> TickInputs {
        pairs
            .iter()
            .map(|(i, v)| {
                let input = v
                    .clone()
                    .map_or(AgentInput::Missing, AgentInput::Received);
                (AgentIndex(*i), input)
            })
            .collect()
    }

    #[test]
    fn idle_tracks_latest_inputs() {
        let mut sim = IdleSimulation::new("hexagon");
        let progress = sim
            .advance(Tick(0), &inputs(&[(0, Some(json!("left"))), (1, None)]))
            .unwrap();
        assert_eq!(progress, Progress::Continue);
        assert_eq!(sim.inputs_received(), 1);
        assert_eq!(sim.inputs_missing(), 1);

        let snap = sim.snapshot(Tick(0));
        assert_eq!(snap.tick, Tick(0));
        assert_eq!(snap.state["agents"]["0"], "left");
    }

    #[test]
    fn idle_rejects_out_of_order_ticks() {
        let mut sim = IdleSimulation::new("hexagon");
        let err = sim.advance(Tick(3), &TickInputs::new()).unwrap_err();
        assert!(matches!(err, SimulationError::OutOfOrder { .. }));
    }

    #[test]
    fn idle_concludes_after_limit() {
        let mut sim = IdleSimulation::new("hexagon").concluding_after(Tick(1));
        assert_eq!(sim.advance(Tick(0), &TickInputs::new()).unwrap(), Progress::Continue);
        assert!(matches!(
            sim.advance(Tick(1), &TickInputs::new()).unwrap(),
            Progress::Concluded { .. }
        ));
    }

    #[test]
    fn observation_includes_last_input() {
        let mut sim = IdleSimulation::new("hexagon");
        sim.advance(Tick(0), &inputs(&[(2, Some(json!({"fire": true})))]))
            .unwrap();
        let obs = sim.observe(AgentIndex(2), Tick(1));
        assert_eq!(obs["last_input"]["fire"], true);
        assert_eq!(obs["you"], 2);
    }

    #[test]
    fn builtin_maps_know_hexagon() {
        let maps = BuiltinMaps::new();
        assert!(maps.load("hexagon", 2).is_ok());
        let err = maps.load("atlantis", 1).err().unwrap();
        assert!(err.to_string().contains("hexagon"));
        assert!(matches!(
            maps.load("hexagon", 9).err().unwrap(),
            MapError::TooManyAgents { max: 8, .. }
        ));
    }
}
