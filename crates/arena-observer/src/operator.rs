//! Operator control endpoint.
//!
//! `POST /api/operator/stop` triggers the session's external abort. The
//! session finishes the tick in progress, drains, and terminates with
//! `Aborted`.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::info;

use crate::state::AppState;

/// Abort source recorded when the stop endpoint fires.
pub const OPERATOR_SOURCE: &str = "operator stop";

/// Response body for operator actions.
#[derive(Debug, Serialize)]
struct OperatorResponse {
    /// Whether the request was accepted.
    ok: bool,
    /// Human-readable message.
    message: String,
}

// ---------------------------------------------------------------------------
// POST /api/operator/stop
// ---------------------------------------------------------------------------

/// Request an abort of the running session.
///
/// Repeated requests are accepted; only the first one is recorded as the
/// abort origin.
pub async fn stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.abort.is_triggered() {
        return Json(OperatorResponse {
            ok: true,
            message: "Abort already requested".to_owned(),
        });
    }

    state.abort.trigger(OPERATOR_SOURCE);
    info!(session = %state.status.session(), "Abort requested by operator");

    Json(OperatorResponse {
        ok: true,
        message: "Abort requested -- session will stop after the current tick".to_owned(),
    })
}
