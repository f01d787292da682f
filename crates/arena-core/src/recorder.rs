//! Session recording.
//!
//! A [`Recorder`] receives the snapshot of every completed tick. The
//! session holds a `Box<dyn Recorder>`: [`NullRecorder`] when no recording
//! destination is configured, [`FileRecorder`] otherwise.
//!
//! [`FileRecorder`] writes JSON Lines (see [`RecordEntry`]). Lines are
//! serialized on the session task and handed to a writer task through a
//! bounded queue; the writer writes and flushes each line whole before
//! taking the next, so a crash never leaves a partial entry ahead of a
//! complete one. When the queue is full, `record` waits up to the
//! configured timeout and then fails rather than stalling the tick loop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_types::{RecordEntry, SessionId, Snapshot, Tick};
use chrono::Utc;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines buffered between the session and the writer.
pub const RECORD_QUEUE_CAPACITY: usize = 64;

/// Errors that can occur while recording.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// The destination could not be opened or read.
    #[error("recording file {path}: {source}")]
    Io {
        /// The recording path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An entry could not be serialized.
    #[error("failed to encode recording entry: {source}")]
    Encode {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// A frame was offered for a tick not after the previous one.
    #[error("frame for tick {got} recorded after tick {last}")]
    OutOfOrder {
        /// Last tick recorded.
        last: Tick,
        /// Tick offered.
        got: Tick,
    },

    /// The writer did not accept the frame in time.
    #[error("recording queue full for {waited_ms} ms")]
    Backpressure {
        /// How long the session waited.
        waited_ms: u64,
    },

    /// The writer failed; the recording is incomplete.
    #[error("recording writer failed: {reason}")]
    Writer {
        /// What went wrong.
        reason: String,
    },

    /// The recorder was already closed.
    #[error("recorder is closed")]
    Closed,

    /// A recording line could not be parsed.
    #[error("corrupt recording at line {line}: {source}")]
    Corrupt {
        /// One-based line number.
        line: usize,
        /// The underlying parse error.
        source: serde_json::Error,
    },
}

/// Destination for per-tick snapshots.
pub trait Recorder: Send {
    /// Append the snapshot of a completed tick.
    ///
    /// Ticks must be strictly increasing.
    fn record<'a>(
        &'a mut self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<(), RecorderError>>;

    /// Finalize the recording. Later calls return `Ok(())` and write nothing.
    fn close(&mut self) -> BoxFuture<'_, Result<(), RecorderError>>;

    /// Frames accepted so far.
    fn frames(&self) -> u64;
}

/// Recording disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn record<'a>(
        &'a mut self,
        _snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<(), RecorderError>> {
        futures::future::ready(Ok(())).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), RecorderError>> {
        futures::future::ready(Ok(())).boxed()
    }

    fn frames(&self) -> u64 {
        0
    }
}

/// Facts written into the recording header.
#[derive(Debug, Clone)]
pub struct RecordingInfo {
    /// Session being recorded.
    pub session: SessionId,
    /// Map being played.
    pub map: String,
    /// Ticks per second.
    pub tick_rate: u32,
}

/// JSON Lines recorder backed by a writer task.
#[derive(Debug)]
pub struct FileRecorder {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    writer: Option<JoinHandle<std::io::Result<()>>>,
    /// First writer error, reported on the next call.
    failure: Arc<Mutex<Option<String>>>,
    timeout: Duration,
    last_tick: Option<Tick>,
    frames: u64,
}

impl FileRecorder {
    /// Create (truncating) the recording at `path` and queue its header.
    ///
    /// `timeout` bounds how long `record` waits on a full queue.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Io`] if the file cannot be created.
    pub fn open(
        path: &Path,
        info: &RecordingInfo,
        timeout: Duration,
    ) -> Result<Self, RecorderError> {
        let file = std::fs::File::create(path).map_err(|source| RecorderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Recording opened");
        let out = tokio::io::BufWriter::new(tokio::fs::File::from_std(file));
        Self::from_writer(Box::new(out), info, timeout)
    }

    /// Record into an arbitrary writer.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Encode`] if the header cannot be serialized.
    pub fn from_writer(
        mut out: Box<dyn AsyncWrite + Send + Unpin>,
        info: &RecordingInfo,
        timeout: Duration,
    ) -> Result<Self, RecorderError> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(RECORD_QUEUE_CAPACITY);
        let failure = Arc::new(Mutex::new(None));

        let header = encode(&RecordEntry::Header {
            session: info.session,
            map: info.map.clone(),
            tick_rate: info.tick_rate,
            started_at: Utc::now(),
        })?;
        tx.try_send(header).map_err(|e| RecorderError::Writer {
            reason: format!("failed to queue header: {e}"),
        })?;

        let writer_failure = Arc::clone(&failure);
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_line(out.as_mut(), &line).await {
                    warn!(error = %e, "Recording write failed");
                    if let Ok(mut slot) = writer_failure.lock() {
                        slot.get_or_insert_with(|| e.to_string());
                    }
                    return Err(e);
                }
            }
            out.shutdown().await
        });

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
            failure,
            timeout,
            last_tick: None,
            frames: 0,
        })
    }

    fn writer_failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|slot| slot.clone())
    }

    async fn enqueue(&self, line: Vec<u8>) -> Result<(), RecorderError> {
        let tx = self.tx.as_ref().ok_or(RecorderError::Closed)?;
        match tx.send_timeout(line, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(RecorderError::Backpressure {
                waited_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(SendTimeoutError::Closed(_)) => Err(RecorderError::Writer {
                reason: self
                    .writer_failure()
                    .unwrap_or_else(|| "writer stopped".to_owned()),
            }),
        }
    }

    async fn record_frame(&mut self, snapshot: &Snapshot) -> Result<(), RecorderError> {
        if self.tx.is_none() {
            return Err(RecorderError::Closed);
        }
        if let Some(reason) = self.writer_failure() {
            return Err(RecorderError::Writer { reason });
        }
        if let Some(last) = self.last_tick {
            if snapshot.tick <= last {
                return Err(RecorderError::OutOfOrder {
                    last,
                    got: snapshot.tick,
                });
            }
        }

        let line = encode(&RecordEntry::Frame {
            tick: snapshot.tick,
            snapshot: snapshot.clone(),
        })?;
        self.enqueue(line).await?;
        self.last_tick = Some(snapshot.tick);
        self.frames = self.frames.saturating_add(1);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), RecorderError> {
        if self.tx.is_none() {
            return Ok(());
        }

        let trailer = encode(&RecordEntry::Trailer {
            frames: self.frames,
            ended_at: Utc::now(),
        })?;
        let queued = self.enqueue(trailer).await;
        self.tx = None;

        let joined = match self.writer.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RecorderError::Writer {
                    reason: e.to_string(),
                }),
                Err(e) => Err(RecorderError::Writer {
                    reason: e.to_string(),
                }),
            },
            None => Ok(()),
        };
        joined?;
        queued?;
        debug!(frames = self.frames, "Recording closed");
        Ok(())
    }
}

impl Recorder for FileRecorder {
    fn record<'a>(
        &'a mut self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<(), RecorderError>> {
        self.record_frame(snapshot).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), RecorderError>> {
        self.finish().boxed()
    }

    fn frames(&self) -> u64 {
        self.frames
    }
}

/// Write one line whole and flush it before returning.
async fn write_line(out: &mut (dyn AsyncWrite + Send + Unpin), line: &[u8]) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.flush().await
}

fn encode(entry: &RecordEntry) -> Result<Vec<u8>, RecorderError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    Ok(line)
}

/// Read every complete entry of a recording.
///
/// A final line without a terminating newline is a write cut short by a
/// crash and is ignored.
///
/// # Errors
///
/// Returns [`RecorderError::Io`] if the file cannot be read, or
/// [`RecorderError::Corrupt`] if a complete line does not parse.
pub fn read_recording(path: &Path) -> Result<Vec<RecordEntry>, RecorderError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RecorderError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let complete = contents.rfind('\n').map_or("", |end| contents.get(..end).unwrap_or(""));
    complete
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|source| RecorderError::Corrupt {
                line: n.saturating_add(1),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("arena-{name}-{}.jsonl", uuid::Uuid::new_v4()))
    }

    fn info() -> RecordingInfo {
        RecordingInfo {
            session: SessionId::new(),
            map: "hexagon".to_owned(),
            tick_rate: 20,
        }
    }

    fn snap(tick: u64) -> Snapshot {
        Snapshot {
            tick: Tick(tick),
            map: "hexagon".to_owned(),
            state: json!({ "n": tick }),
        }
    }

    #[tokio::test]
    async fn records_header_frames_and_trailer_in_order() {
        let path = temp_path("rec");
        let mut rec = FileRecorder::open(&path, &info(), Duration::from_millis(250)).unwrap();
        for t in 0..10 {
            rec.record(&snap(t)).await.unwrap();
        }
        rec.close().await.unwrap();
        assert_eq!(rec.frames(), 10);

        let entries = read_recording(&path).unwrap();
        assert_eq!(entries.len(), 12);
        assert!(matches!(entries[0], RecordEntry::Header { tick_rate: 20, .. }));
        let ticks: Vec<u64> = entries.iter().filter_map(|e| e.tick()).map(Tick::value).collect();
        assert_eq!(ticks, (0..10).collect::<Vec<_>>());
        assert!(matches!(entries[11], RecordEntry::Trailer { frames: 10, .. }));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let path = temp_path("rec-close");
        let mut rec = FileRecorder::open(&path, &info(), Duration::from_millis(250)).unwrap();
        rec.record(&snap(0)).await.unwrap();
        rec.close().await.unwrap();
        rec.close().await.unwrap();

        let entries = read_recording(&path).unwrap();
        let trailers = entries
            .iter()
            .filter(|e| matches!(e, RecordEntry::Trailer { .. }))
            .count();
        assert_eq!(trailers, 1);
        assert!(matches!(
            rec.record(&snap(1)).await.unwrap_err(),
            RecorderError::Closed
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rejects_non_increasing_ticks() {
        let path = temp_path("rec-order");
        let mut rec = FileRecorder::open(&path, &info(), Duration::from_millis(250)).unwrap();
        rec.record(&snap(3)).await.unwrap();
        let err = rec.record(&snap(3)).await.unwrap_err();
        assert!(matches!(err, RecorderError::OutOfOrder { .. }));
        rec.close().await.unwrap();

        let frames = read_recording(&path)
            .unwrap()
            .iter()
            .filter(|e| e.tick().is_some())
            .count();
        assert_eq!(frames, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn partial_last_line_is_ignored() {
        let path = temp_path("rec-partial");
        let frame = serde_json::to_string(&RecordEntry::Frame {
            tick: Tick(0),
            snapshot: snap(0),
        })
        .unwrap();
        std::fs::write(&path, format!("{frame}\n{{\"entry\":\"frame\",\"ti")).unwrap();

        let entries = read_recording(&path).unwrap();
        assert_eq!(entries.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn writer_failure_is_reported() {
        let (ours, theirs) = tokio::io::duplex(16);
        drop(theirs);
        let mut rec = FileRecorder::from_writer(Box::new(ours), &info(), Duration::from_millis(50))
            .unwrap();
        let err = rec.close().await.unwrap_err();
        assert!(matches!(err, RecorderError::Writer { .. }));
        assert!(rec.close().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out() {
        // Nobody reads the other end: the writer stalls on the header.
        let (ours, theirs) = tokio::io::duplex(16);
        let mut rec =
            FileRecorder::from_writer(Box::new(ours), &info(), Duration::from_millis(20)).unwrap();

        let mut result = Ok(());
        for t in 0..200 {
            result = rec.record(&snap(t)).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(RecorderError::Backpressure { waited_ms: 20 })));
        assert!(rec.frames() <= RECORD_QUEUE_CAPACITY as u64);

        drop(theirs);
        assert!(rec.close().await.is_err());
    }

    #[tokio::test]
    async fn null_recorder_accepts_everything() {
        let mut rec = NullRecorder;
        rec.record(&snap(5)).await.unwrap();
        rec.record(&snap(1)).await.unwrap();
        rec.close().await.unwrap();
        assert_eq!(rec.frames(), 0);
    }
}
