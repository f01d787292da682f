//! Agent wire protocol.
//!
//! Messages are JSON objects, one per line, over a byte stream. The trainer
//! opens the connection and greets the agent; the agent answers with its
//! name, then replies to every perception with an input for the same tick.
//!
//! ```text
//! trainer                         agent
//!    | -- welcome {agent, ...} -->  |
//!    | <-- hello {name} ----------  |
//!    | -- perception {tick, obs} -> |
//!    | <-- input {tick, payload} -- |
//!    |            ...               |
//!    | -- goodbye {reason} -------> |
//! ```

use serde::{Deserialize, Serialize};

use crate::ids::{AgentIndex, SessionId, Tick};

/// A message sent from the trainer to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on a new connection.
    Welcome {
        /// Index assigned to the agent for this session.
        agent: AgentIndex,
        /// Session the agent is joining.
        session: SessionId,
        /// Ticks per second.
        tick_rate: u32,
        /// Map being played.
        map: String,
    },
    /// Request for input at a tick.
    Perception {
        /// Tick the input is for.
        tick: Tick,
        /// Simulation-defined observation for this agent.
        observation: serde_json::Value,
    },
    /// Out-of-band payload pushed by the trainer.
    Notice {
        /// Simulation-defined payload.
        payload: serde_json::Value,
    },
    /// The session is ending.
    Goodbye {
        /// Human-readable reason.
        reason: String,
    },
}

/// A message sent from an agent to the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Handshake reply.
    Hello {
        /// Name the agent wants to be shown as.
        name: String,
    },
    /// Input for a tick.
    Input {
        /// Tick this input answers.
        tick: Tick,
        /// Agent-defined payload.
        payload: serde_json::Value,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn agent_input_line_format() {
        let line = r#"{"type":"input","tick":4,"payload":{"steer":0.5}}"#;
        let msg: AgentMessage = serde_json::from_str(line).unwrap();
        assert_eq!(
            msg,
            AgentMessage::Input {
                tick: Tick(4),
                payload: serde_json::json!({"steer": 0.5}),
            }
        );
    }

    #[test]
    fn perception_is_tagged() {
        let msg = ServerMessage::Perception {
            tick: Tick(9),
            observation: serde_json::json!(null),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "perception");
        assert_eq!(json["tick"], 9);
    }
}
