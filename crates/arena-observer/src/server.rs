//! Observer HTTP server lifecycle.
//!
//! [`start_server`] binds the listen address, then serves the router on a
//! background task until [`RunningServer::shutdown`] is called.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::AppState;

/// Errors that can occur when starting or running the observer server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server encountered a fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),
}

/// A server started by [`start_server`].
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    /// The address the server actually bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests. Connections still open after that are dropped.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ServerError> {
        // The receiver is gone only if the server already stopped.
        let _ = self.shutdown.send(());

        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ServerError::Serve(format!("server task failed: {join}"))),
            Err(_elapsed) => {
                warn!(
                    grace_ms = grace.as_millis(),
                    "Observer server did not stop in time, dropping connections"
                );
                task.abort();
                Ok(())
            }
        }
    }
}

/// Bind `listen_addr` (`host:port`) and serve the observer router.
///
/// Binding happens before this returns, so an unusable address is
/// reported here rather than from the background task.
pub async fn start_server(
    listen_addr: &str,
    state: Arc<AppState>,
) -> Result<RunningServer, ServerError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {listen_addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(format!("no local address for {listen_addr}: {e}")))?;

    info!(%local_addr, "Observer server listening");

    let router = build_router(state);
    let (shutdown, stop) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.await;
            })
            .await
            .map_err(|e| ServerError::Serve(format!("serve error: {e}")))
    });

    Ok(RunningServer {
        local_addr,
        shutdown,
        task,
    })
}
