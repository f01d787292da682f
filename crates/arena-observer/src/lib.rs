//! Visualization endpoint for the Arena trainer.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **`WebSocket` endpoint** (`/ws/frames`) streaming every published
//!   snapshot via [`tokio::sync::broadcast`]
//! - **REST endpoints** for the live session status and the latest
//!   snapshot
//! - **Operator endpoint** (`POST /api/operator/stop`) that requests an
//!   external abort
//! - **Minimal HTML page** (`GET /`) with the viewer link
//!
//! # Architecture
//!
//! [`ObserverEndpoint`] implements the session publisher's
//! [`FrameTransport`]: the publisher worker hands it the newest frame, the
//! endpoint serializes it once, keeps it as the latest snapshot and fans
//! it out to connected viewers. A viewer that falls behind skips ahead to
//! the newest frame; nothing here ever waits on a viewer.
//!
//! [`FrameTransport`]: arena_core::publisher::FrameTransport

pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod operator;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use endpoint::ObserverEndpoint;
pub use router::build_router;
pub use server::{RunningServer, ServerError, start_server};
pub use state::AppState;
