//! Visualization publisher.
//!
//! The session hands every snapshot to [`Publisher::publish`], which only
//! replaces the contents of a single-slot `watch` channel and returns. A
//! background task takes the newest frame from the slot and delivers it
//! through a [`FrameTransport`]. A viewer that cannot keep up therefore
//! sees fewer frames, never an older one, and never slows the tick loop.
//!
//! Delivery failures are logged and retried with exponential backoff,
//! always with the newest frame available at retry time. They are never a
//! session error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arena_types::Snapshot;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First retry delay after a failed delivery.
const BACKOFF_INITIAL: Duration = Duration::from_millis(50);

/// Longest retry delay.
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Errors raised by a frame transport.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// The transport could not start serving.
    #[error("failed to open visualization endpoint on {addr}: {reason}")]
    Open {
        /// Address the transport tried to use.
        addr: String,
        /// What went wrong.
        reason: String,
    },

    /// A frame could not be delivered.
    #[error("frame delivery failed: {reason}")]
    Delivery {
        /// What went wrong.
        reason: String,
    },

    /// A delivery exceeded the per-delivery timeout.
    #[error("frame delivery timed out after {after_ms} ms")]
    TimedOut {
        /// The timeout that elapsed.
        after_ms: u64,
    },
}

/// Carries frames to viewers.
pub trait FrameTransport: Send + Sync {
    /// Start serving on `listen_addr`. Called once before the first frame.
    fn open<'a>(&'a self, listen_addr: &'a str) -> BoxFuture<'a, Result<(), PublisherError>> {
        let _ = listen_addr;
        futures::future::ready(Ok(())).boxed()
    }

    /// Deliver one frame.
    fn deliver(&self, frame: Arc<Snapshot>) -> BoxFuture<'_, Result<(), PublisherError>>;

    /// Stop serving. Called once after the last delivery.
    fn close(&self) -> BoxFuture<'_, ()> {
        futures::future::ready(()).boxed()
    }
}

/// Transport with no viewer attached; every delivery succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl FrameTransport for NullTransport {
    fn deliver(&self, _frame: Arc<Snapshot>) -> BoxFuture<'_, Result<(), PublisherError>> {
        futures::future::ready(Ok(())).boxed()
    }
}

/// Delivery counters, readable while the publisher runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    /// Frames handed to [`Publisher::publish`].
    pub published: u64,
    /// Frames the transport accepted.
    pub delivered: u64,
    /// Failed or timed-out delivery attempts.
    pub failures: u64,
    /// Frames superseded before delivery.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

/// A snapshot waiting in the slot.
#[derive(Debug, Clone)]
struct Frame {
    seq: u64,
    snapshot: Arc<Snapshot>,
}

/// Latest-wins, non-blocking snapshot publisher.
#[derive(Debug)]
pub struct Publisher {
    slot: Option<watch::Sender<Option<Frame>>>,
    worker: Option<JoinHandle<()>>,
    transport: Arc<dyn FrameTransport>,
    counters: Arc<Counters>,
    seq: u64,
}

impl std::fmt::Debug for dyn FrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameTransport")
    }
}

impl Publisher {
    /// Start the delivery task for `transport`.
    ///
    /// `delivery_timeout` bounds each delivery attempt.
    pub fn start(transport: Arc<dyn FrameTransport>, delivery_timeout: Duration) -> Self {
        let (slot, rx) = watch::channel(None);
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(deliver_frames(
            Arc::clone(&transport),
            rx,
            delivery_timeout,
            Arc::clone(&counters),
        ));
        Self {
            slot: Some(slot),
            worker: Some(worker),
            transport,
            counters,
            seq: 0,
        }
    }

    /// Offer a snapshot to viewers. Never waits.
    ///
    /// A frame still waiting in the slot is replaced and counted as dropped.
    pub fn publish(&mut self, snapshot: Snapshot) {
        let Some(slot) = self.slot.as_ref() else {
            debug!(tick = snapshot.tick.value(), "Publisher closed, frame discarded");
            return;
        };
        self.seq = self.seq.saturating_add(1);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        slot.send_replace(Some(Frame {
            seq: self.seq,
            snapshot: Arc::new(snapshot),
        }));
    }

    /// Current delivery counters.
    pub fn stats(&self) -> PublisherStats {
        let published = self.counters.published.load(Ordering::Relaxed);
        let delivered = self.counters.delivered.load(Ordering::Relaxed);
        PublisherStats {
            published,
            delivered,
            failures: self.counters.failures.load(Ordering::Relaxed),
            dropped: published.saturating_sub(delivered),
        }
    }

    /// Stop accepting frames and let the pending delivery finish.
    ///
    /// Waits up to `grace` for the delivery task, then abandons it and
    /// closes the transport. Calling this again does nothing.
    pub async fn close(&mut self, grace: Duration) -> PublisherStats {
        let Some(slot) = self.slot.take() else {
            return self.stats();
        };
        drop(slot);

        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                warn!(
                    grace_ms = grace.as_millis(),
                    "Frame delivery did not finish in time, abandoning"
                );
                worker.abort();
            }
        }
        self.transport.close().await;

        let stats = self.stats();
        info!(
            published = stats.published,
            delivered = stats.delivered,
            dropped = stats.dropped,
            failures = stats.failures,
            "Publisher closed"
        );
        stats
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Delivery loop: one frame in flight, always the newest.
async fn deliver_frames(
    transport: Arc<dyn FrameTransport>,
    mut rx: watch::Receiver<Option<Frame>>,
    delivery_timeout: Duration,
    counters: Arc<Counters>,
) {
    let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX);

    // `changed` still reports a frame published just before the sender
    // was dropped, so the final frame is delivered during close.
    while rx.changed().await.is_ok() {
        loop {
            let Some(frame) = rx.borrow_and_update().clone() else {
                break;
            };
            let delivery = transport.deliver(Arc::clone(&frame.snapshot));
            let attempt = tokio::time::timeout(delivery_timeout, delivery)
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(PublisherError::TimedOut {
                        after_ms: u64::try_from(delivery_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    })
                });

            match attempt {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    backoff.reset();
                    debug!(tick = frame.snapshot.tick.value(), seq = frame.seq, "Frame delivered");
                    break;
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    warn!(
                        tick = frame.snapshot.tick.value(),
                        error = %e,
                        retry_ms = delay.as_millis(),
                        "Frame delivery failed"
                    );
                    // Retry after the delay, or sooner with a newer frame.
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    const fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay before the next attempt: the current step plus up to half of
    /// it again, after which the step doubles up to the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let half_ms = u64::try_from(base.as_millis() / 2).unwrap_or(0);
        let jitter = Duration::from_millis(rand::random_range(0..=half_ms));
        self.current = base.saturating_mul(2).min(self.max);
        base.saturating_add(jitter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use arena_types::Tick;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;

    fn snap(tick: u64) -> Snapshot {
        Snapshot {
            tick: Tick(tick),
            map: "hexagon".to_owned(),
            state: json!({}),
        }
    }

    /// Records delivered ticks; each delivery takes `delay` and the first
    /// `fail_first` attempts fail.
    struct ScriptedTransport {
        delay: Duration,
        fail_first: AtomicU64,
        delivered: Mutex<Vec<u64>>,
    }

    impl ScriptedTransport {
        fn new(delay: Duration, fail_first: u64) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail_first: AtomicU64::new(fail_first),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn ticks(&self) -> Vec<u64> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl FrameTransport for ScriptedTransport {
        fn deliver(&self, frame: Arc<Snapshot>) -> BoxFuture<'_, Result<(), PublisherError>> {
            async move {
                tokio::time::sleep(self.delay).await;
                let remaining = self.fail_first.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_first.store(remaining.saturating_sub(1), Ordering::SeqCst);
                    return Err(PublisherError::Delivery {
                        reason: "viewer unreachable".to_owned(),
                    });
                }
                self.delivered.lock().unwrap().push(frame.tick.value());
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_never_waits_on_a_slow_transport() {
        let transport = ScriptedTransport::new(Duration::from_secs(30), 0);
        let mut publisher = Publisher::start(transport, Duration::from_secs(60));

        let started = Instant::now();
        for tick in 0..1000 {
            publisher.publish(snap(tick));
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(publisher.stats().published, 1000);

        let stats = publisher.close(Duration::from_millis(100)).await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_frame_wins() {
        let transport = ScriptedTransport::new(Duration::from_millis(100), 0);
        let mut publisher = Publisher::start(
            Arc::clone(&transport) as Arc<dyn FrameTransport>,
            Duration::from_secs(1),
        );

        for tick in 0..10 {
            publisher.publish(snap(tick));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        publisher.close(Duration::from_secs(1)).await;

        let ticks = transport.ticks();
        assert!(ticks.len() < 10);
        assert!(ticks.windows(2).all(|w| w.first() < w.get(1)));
        assert_eq!(ticks.last(), Some(&9));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deliveries_are_retried() {
        let transport = ScriptedTransport::new(Duration::from_millis(1), 3);
        let mut publisher = Publisher::start(
            Arc::clone(&transport) as Arc<dyn FrameTransport>,
            Duration::from_secs(1),
        );

        publisher.publish(snap(7));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = publisher.close(Duration::from_secs(1)).await;
        assert_eq!(transport.ticks(), vec![7]);
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_times_out_and_counts_as_failure() {
        let transport = ScriptedTransport::new(Duration::from_secs(10), 0);
        let mut publisher = Publisher::start(
            Arc::clone(&transport) as Arc<dyn FrameTransport>,
            Duration::from_millis(250),
        );

        publisher.publish(snap(0));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(publisher.stats().failures >= 1);
        publisher.close(Duration::from_millis(10)).await;
        assert!(transport.ticks().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut publisher = Publisher::start(Arc::new(NullTransport), Duration::from_millis(250));
        publisher.publish(snap(0));
        let first = publisher.close(Duration::from_secs(1)).await;
        let second = publisher.close(Duration::from_secs(1)).await;
        assert_eq!(first, second);
        assert_eq!(first.delivered, 1);

        publisher.publish(snap(1));
        assert_eq!(publisher.stats().published, 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(450));
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }
}
