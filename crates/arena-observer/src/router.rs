//! Axum router for the observer endpoint.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{handlers, operator, ws};

/// Build the observer router.
///
/// - `GET /` -- minimal HTML status page
/// - `GET /ws/frames` -- `WebSocket` snapshot stream
/// - `GET /api/status` -- session status
/// - `GET /api/snapshot` -- latest snapshot, 404 before the first frame
/// - `POST /api/operator/stop` -- request an abort
///
/// CORS allows any origin so a viewer served elsewhere can connect.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::index))
        .route("/ws/frames", get(ws::ws_frames))
        .route("/api/status", get(handlers::status))
        .route("/api/snapshot", get(handlers::snapshot))
        .route("/api/operator/stop", post(operator::stop))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
