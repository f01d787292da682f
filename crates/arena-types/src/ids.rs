//! Type-safe identifiers for the trainer.
//!
//! Sessions are identified by a UUID v7 (time-ordered) so recordings sort
//! naturally on disk. Agents and ticks are small integer newtypes: an agent
//! is referenced by its stable position in the connection arena, and a tick
//! is the sole ordering key for every per-tick artifact.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id! {
    /// Unique identifier for a training session.
    SessionId
}

/// Stable index of an agent within a session's connection arena.
///
/// Assigned in configuration order at session start and never reused, so
/// an index stays valid even after the agent behind it has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentIndex(pub u32);

impl AgentIndex {
    /// Return the index as a `usize` for arena lookups.
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl core::fmt::Display for AgentIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A discrete simulation step.
///
/// Ticks start at 0 and increase by exactly one; the orchestrator never
/// skips or reorders them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tick(pub u64);

impl Tick {
    /// The first tick of every session.
    pub const ZERO: Self = Self(0);

    /// Return the raw tick number.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Return the following tick, or `None` on counter overflow.
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }
}

impl core::fmt::Display for Tick {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tick_next_increments() {
        assert_eq!(Tick::ZERO.next(), Some(Tick(1)));
        assert_eq!(Tick(u64::MAX).next(), None);
    }

    #[test]
    fn agent_index_serializes_as_plain_number() {
        let json = serde_json::to_string(&AgentIndex(3)).unwrap();
        assert_eq!(json, "3");
    }

    #[test]
    fn session_id_displays_as_uuid() {
        let id = SessionId::new();
        assert_eq!(id.to_string(), id.into_inner().to_string());
    }
}
