//! [`FrameTransport`] backed by the observer server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arena_core::publisher::{FrameTransport, PublisherError};
use arena_types::Snapshot;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::server::{RunningServer, start_server};
use crate::state::AppState;

/// How long [`FrameTransport::close`] waits for open requests.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Serves published frames over HTTP and `WebSocket`.
///
/// `open` binds the listen address and starts the server, `deliver`
/// stores and broadcasts a frame, `close` stops the server.
#[derive(Debug)]
pub struct ObserverEndpoint {
    state: Arc<AppState>,
    server: Mutex<Option<RunningServer>>,
}

impl ObserverEndpoint {
    /// Create an endpoint over `state`. Nothing is bound until `open`.
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            server: Mutex::new(None),
        }
    }

    /// The shared handler state.
    pub const fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// The bound address while the server is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(RunningServer::local_addr)
    }
}

impl FrameTransport for ObserverEndpoint {
    fn open<'a>(&'a self, listen_addr: &'a str) -> BoxFuture<'a, Result<(), PublisherError>> {
        async move {
            let mut server = self.server.lock().await;
            if server.is_some() {
                return Ok(());
            }
            let running = start_server(listen_addr, Arc::clone(&self.state))
                .await
                .map_err(|err| PublisherError::Open {
                    addr: listen_addr.to_owned(),
                    reason: err.to_string(),
                })?;
            *server = Some(running);
            Ok(())
        }
        .boxed()
    }

    fn deliver(&self, frame: Arc<Snapshot>) -> BoxFuture<'_, Result<(), PublisherError>> {
        async move {
            let viewers = self
                .state
                .publish_frame(&frame)
                .await
                .map_err(|err| PublisherError::Delivery {
                    reason: err.to_string(),
                })?;
            debug!(tick = frame.tick.value(), viewers, "Frame delivered");
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            let running = self.server.lock().await.take();
            if let Some(running) = running
                && let Err(err) = running.shutdown(SHUTDOWN_GRACE).await
            {
                warn!(error = %err, "Observer server stopped with an error");
            }
        }
        .boxed()
    }
}
