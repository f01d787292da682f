//! `WebSocket` frame stream.
//!
//! Viewers connect to `GET /ws/frames` and receive every published
//! snapshot as a JSON text message, starting with the latest one if a
//! frame has already been published. A viewer that falls behind skips
//! ahead to the newest frames.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::state::AppState;

/// Upgrade an HTTP request to a `WebSocket` frame stream.
///
/// # Route
///
/// `GET /ws/frames`
pub async fn ws_frames(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("Viewer connected");

    // Subscribe first so no frame falls between the latest and the stream.
    let mut rx = state.subscribe();
    if let Some(frame) = state.latest_frame().await
        && socket.send(Message::Text(frame.as_ref().into())).await.is_err()
    {
        debug!("Viewer disconnected (send failed)");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.as_ref().into())).await.is_err() {
                            debug!("Viewer disconnected (send failed)");
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Viewer lagged, skipping ahead");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Frame stream closed");
                        return;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Viewer disconnected");
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        return;
                    }
                    // Viewers have nothing to say.
                    _ => {}
                }
            }
        }
    }
}
