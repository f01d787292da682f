//! Enumeration types shared across the trainer.

use serde::{Deserialize, Serialize};

use crate::ids::AgentIndex;

/// Lifecycle of a single agent connection.
///
/// ```text
/// Pending -> Connected -> Acknowledging -> Disconnected
///    |           |              |
///    +-----------+--------------+--> Failed
/// ```
///
/// `Failed` and `Disconnected` are terminal: an agent in either state is
/// never collected from again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentConnectionState {
    /// Connection not yet established.
    Pending,
    /// Handshake completed, no tick acknowledged yet.
    Connected,
    /// The agent has answered at least one tick request.
    Acknowledging,
    /// Orderly teardown at session end.
    Disconnected,
    /// Unreachable, dropped, or missed too many ticks.
    Failed,
}

impl AgentConnectionState {
    /// Whether the agent still takes part in input collection.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Acknowledging)
    }
}

/// Phase of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Connecting agents, opening sinks, loading the map.
    Initializing,
    /// Ticking.
    Running,
    /// Termination decided; flushing sinks and closing connections.
    Draining,
    /// Terminal; the result has been produced.
    Terminated,
}

/// Direction of a captured agent exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommDirection {
    /// Trainer to agent.
    Sent,
    /// Agent to trainer.
    Received,
}

impl CommDirection {
    /// Short tag used in capture files.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Sent => ">>",
            Self::Received => "<<",
        }
    }
}

/// Terminal outcome of a training session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionResult {
    /// The simulation reported that the game concluded.
    CompletedNormally,
    /// The configured maximum duration elapsed.
    TimedOut,
    /// The session was stopped before or during running.
    Aborted {
        /// Why the session was aborted.
        reason: String,
    },
    /// No connected agent remains.
    AgentFailure {
        /// The agent whose loss emptied the session.
        agent: AgentIndex,
        /// What happened to that agent.
        reason: String,
    },
}

impl SessionResult {
    /// Whether this outcome is an expected end rather than a failure.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::CompletedNormally | Self::TimedOut)
    }
}

impl core::fmt::Display for SessionResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CompletedNormally => write!(f, "game completed"),
            Self::TimedOut => write!(f, "maximum duration reached"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
            Self::AgentFailure { agent, reason } => {
                write!(f, "agent {agent} failed: {reason}")
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_states_are_live() {
        assert!(!AgentConnectionState::Pending.is_live());
        assert!(AgentConnectionState::Connected.is_live());
        assert!(AgentConnectionState::Acknowledging.is_live());
        assert!(!AgentConnectionState::Disconnected.is_live());
        assert!(!AgentConnectionState::Failed.is_live());
    }

    #[test]
    fn session_result_serializes_with_outcome_tag() {
        let result = SessionResult::AgentFailure {
            agent: AgentIndex(1),
            reason: String::from("missed 3 consecutive ticks"),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "agent_failure");
        assert_eq!(json["agent"], 1);
    }

    #[test]
    fn session_result_display() {
        let aborted = SessionResult::Aborted {
            reason: String::from("external signal"),
        };
        assert_eq!(aborted.to_string(), "aborted: external signal");
        assert!(SessionResult::TimedOut.is_success());
        assert!(!aborted.is_success());
    }
}
