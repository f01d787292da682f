//! Opening the viewer in a browser.

use std::sync::Arc;
use std::time::Duration;

use arena_observer::ObserverEndpoint;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TrainerError;

/// How often to check whether the observer is listening.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Give up waiting for the observer after this long.
const LISTEN_WAIT: Duration = Duration::from_secs(10);

/// Platform command that opens a URL with the default handler.
fn launcher(url: &str) -> Command {
    if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    }
}

/// Launch the default browser on `url`.
pub async fn open_browser(url: &str) -> Result<(), TrainerError> {
    let status = launcher(url)
        .status()
        .await
        .map_err(|e| TrainerError::Viewer {
            message: format!("failed to run browser launcher: {e}"),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(TrainerError::Viewer {
            message: format!("browser launcher exited with {status}"),
        })
    }
}

/// Open `url` once `endpoint` is listening.
///
/// Runs in the background; a session that never binds the observer simply
/// never opens the browser.
pub fn open_when_listening(endpoint: Arc<ObserverEndpoint>, url: String) {
    tokio::spawn(async move {
        let waited = tokio::time::timeout(LISTEN_WAIT, async {
            while endpoint.local_addr().await.is_none() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;
        if waited.is_err() {
            debug!("Observer never started listening, not opening the viewer");
            return;
        }

        match open_browser(&url).await {
            Ok(()) => info!(%url, "Viewer opened"),
            Err(e) => warn!(error = %e, %url, "Could not open the viewer, open it manually"),
        }
    });
}
