//! Live session status.
//!
//! The session loop is the only writer. Readers (the status endpoint, the
//! trainer binary) take a cloned [`StatusView`].

use arena_types::{AgentView, SessionId, SessionPhase, SessionResult, Tick};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Serializable copy of the session status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    /// Session identifier.
    pub session: SessionId,
    /// Map being played.
    pub map: String,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Current phase.
    pub phase: SessionPhase,
    /// Last completed tick.
    pub tick: Option<Tick>,
    /// Agent handles, in index order.
    pub agents: Vec<AgentView>,
    /// Final result once the session has terminated.
    pub result: Option<SessionResult>,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
}

/// Shared, lock-protected session status.
#[derive(Debug)]
pub struct SessionStatus {
    session: SessionId,
    inner: RwLock<StatusView>,
}

impl SessionStatus {
    /// Status for a session that is initializing.
    pub fn new(session: SessionId, map: &str, tick_rate: u32) -> Self {
        Self {
            session,
            inner: RwLock::new(StatusView {
                session,
                map: map.to_owned(),
                tick_rate,
                phase: SessionPhase::Initializing,
                tick: None,
                agents: Vec::new(),
                result: None,
                started_at: Utc::now(),
            }),
        }
    }

    /// Session identifier, readable without the lock.
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Copy of the current status.
    pub async fn view(&self) -> StatusView {
        self.inner.read().await.clone()
    }

    /// Current phase.
    pub async fn phase(&self) -> SessionPhase {
        self.inner.read().await.phase
    }

    /// Move to `phase`.
    pub async fn set_phase(&self, phase: SessionPhase) {
        self.inner.write().await.phase = phase;
    }

    /// Record a completed tick and the agent views after it.
    pub async fn record_tick(&self, tick: Tick, agents: Vec<AgentView>) {
        let mut guard = self.inner.write().await;
        guard.tick = Some(tick);
        guard.agents = agents;
    }

    /// Replace the agent views.
    pub async fn set_agents(&self, agents: Vec<AgentView>) {
        self.inner.write().await.agents = agents;
    }

    /// Record the final result and enter `Terminated`.
    pub async fn terminate(&self, result: SessionResult) {
        let mut guard = self.inner.write().await;
        guard.phase = SessionPhase::Terminated;
        guard.result = Some(result);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_phase_tick_and_result() {
        let status = SessionStatus::new(SessionId::new(), "hexagon", 20);
        assert_eq!(status.phase().await, SessionPhase::Initializing);

        status.set_phase(SessionPhase::Running).await;
        status.record_tick(Tick(4), Vec::new()).await;
        let view = status.view().await;
        assert_eq!(view.phase, SessionPhase::Running);
        assert_eq!(view.tick, Some(Tick(4)));
        assert!(view.result.is_none());

        status.terminate(SessionResult::TimedOut).await;
        let view = status.view().await;
        assert_eq!(view.phase, SessionPhase::Terminated);
        assert_eq!(view.result, Some(SessionResult::TimedOut));
    }

    #[tokio::test]
    async fn view_serializes_to_json() {
        let status = SessionStatus::new(SessionId::new(), "deathmatch", 10);
        let json = serde_json::to_value(status.view().await).unwrap();
        assert_eq!(json["phase"], "initializing");
        assert_eq!(json["map"], "deathmatch");
        assert!(json["tick"].is_null());
    }
}
