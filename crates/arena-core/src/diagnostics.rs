//! Raw agent communication capture.
//!
//! When `dump_raw_comm` is enabled every line sent to or received from an
//! agent is handed to a [`CommTap`]. The capture path never touches the
//! exchange itself: [`FileTap`] copies the bytes into an unbounded channel
//! and a writer task formats them, so the agent I/O sees no added latency.
//! [`NullTap`] is selected when capture is disabled.
//!
//! Captured bytes are exact, terminators included. A line without a trailing
//! newline gets one in the capture file so every entry stays on its own line.
//!
//! Capture line format:
//!
//! ```text
//! 2026-10-19T12:00:00.000123Z agent=0 >> {"type":"perception",...}
//! 2026-10-19T12:00:00.004567Z agent=0 << {"type":"input",...}
//! ```

use std::path::Path;
use std::sync::Mutex;

use arena_types::{AgentIndex, CommDirection};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Observer of every byte exchanged with agents.
pub trait CommTap: Send + Sync {
    /// Record one exchanged line exactly as it crossed the link.
    fn capture(&self, agent: AgentIndex, direction: CommDirection, bytes: &[u8]);

    /// Flush everything captured so far and stop accepting captures.
    fn finish(&self) -> BoxFuture<'_, ()>;
}

/// Capture disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTap;

impl CommTap for NullTap {
    fn capture(&self, _agent: AgentIndex, _direction: CommDirection, _bytes: &[u8]) {}

    fn finish(&self) -> BoxFuture<'_, ()> {
        futures::future::ready(()).boxed()
    }
}

/// One captured exchange awaiting the writer.
#[derive(Debug)]
struct Captured {
    at: DateTime<Utc>,
    agent: AgentIndex,
    direction: CommDirection,
    bytes: Vec<u8>,
}

/// Capture to a file or to standard error.
#[derive(Debug)]
pub struct FileTap {
    tx: Mutex<Option<mpsc::UnboundedSender<Captured>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileTap {
    /// Capture into `path`, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be created.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::from_writer(Box::new(tokio::io::BufWriter::new(
            tokio::fs::File::from_std(file),
        ))))
    }

    /// Capture to standard error.
    pub fn stderr() -> Self {
        Self::from_writer(Box::new(tokio::io::stderr()))
    }

    /// Capture into an arbitrary writer.
    pub fn from_writer(mut out: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Captured>();
        let writer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = write_entry(out.as_mut(), &entry).await {
                    warn!(error = %e, "Raw communication capture failed, disabling");
                    return;
                }
            }
            if let Err(e) = out.flush().await {
                warn!(error = %e, "Failed to flush raw communication capture");
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }
}

async fn write_entry(
    out: &mut (dyn AsyncWrite + Send + Unpin),
    entry: &Captured,
) -> std::io::Result<()> {
    let prefix = format!(
        "{} agent={} {} ",
        entry.at.to_rfc3339_opts(SecondsFormat::Micros, true),
        entry.agent,
        entry.direction.tag()
    );
    out.write_all(prefix.as_bytes()).await?;
    out.write_all(&entry.bytes).await?;
    if !entry.bytes.ends_with(b"\n") {
        out.write_all(b"\n").await?;
    }
    out.flush().await
}

impl CommTap for FileTap {
    fn capture(&self, agent: AgentIndex, direction: CommDirection, bytes: &[u8]) {
        let Ok(guard) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            // A closed writer only means capture was disabled after an error.
            let _ = tx.send(Captured {
                at: Utc::now(),
                agent,
                direction,
                bytes: bytes.to_vec(),
            });
        }
    }

    fn finish(&self) -> BoxFuture<'_, ()> {
        let tx = self.tx.lock().ok().and_then(|mut g| g.take());
        let writer = self.writer.lock().ok().and_then(|mut g| g.take());
        async move {
            drop(tx);
            if let Some(handle) = writer {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Raw communication writer task failed");
                }
            }
        }
        .boxed()
    }
}
