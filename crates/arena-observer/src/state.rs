//! Shared state for the visualization endpoint.
//!
//! [`AppState`] is wrapped in an [`Arc`] and handed to every Axum
//! handler. It holds the latest serialized frame, the broadcast channel
//! feeding `WebSocket` viewers, and handles to the session status and
//! abort signal.

use std::sync::Arc;

use arena_core::operator::AbortSignal;
use arena_core::status::SessionStatus;
use arena_types::Snapshot;
use tokio::sync::{RwLock, broadcast};

/// Capacity of the frame broadcast channel. Viewers further behind than
/// this skip ahead to the newest frame.
const BROADCAST_CAPACITY: usize = 64;

/// Shared state accessible to all Axum handlers.
#[derive(Debug)]
pub struct AppState {
    /// Broadcast channel sender for serialized frames.
    frames: broadcast::Sender<Arc<str>>,
    /// Most recent frame, already serialized.
    latest: RwLock<Option<Arc<str>>>,
    /// Live session status.
    pub status: Arc<SessionStatus>,
    /// External abort, triggered by the operator stop endpoint.
    pub abort: Arc<AbortSignal>,
    /// URL shown to humans for opening the viewer.
    pub viewer_url: String,
}

impl AppState {
    /// Create state for one session.
    pub fn new(status: Arc<SessionStatus>, abort: Arc<AbortSignal>, viewer_url: String) -> Self {
        let (frames, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            frames,
            latest: RwLock::new(None),
            status,
            abort,
            viewer_url,
        }
    }

    /// Subscribe to the frame stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.frames.subscribe()
    }

    /// Serialize `snapshot`, keep it as the latest frame and broadcast it.
    ///
    /// Returns the number of viewers that received the frame.
    pub async fn publish_frame(&self, snapshot: &Snapshot) -> Result<usize, serde_json::Error> {
        let frame: Arc<str> = Arc::from(serde_json::to_string(snapshot)?);
        *self.latest.write().await = Some(Arc::clone(&frame));
        // A send error only means no viewer is connected.
        Ok(self.frames.send(frame).unwrap_or(0))
    }

    /// The most recent frame, if any has been published.
    pub async fn latest_frame(&self) -> Option<Arc<str>> {
        self.latest.read().await.clone()
    }

    /// Number of connected `WebSocket` viewers.
    pub fn viewer_count(&self) -> usize {
        self.frames.receiver_count()
    }
}
