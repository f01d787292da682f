//! External abort signal.
//!
//! Shared between the session loop and whoever may stop it: the Ctrl-C
//! handler in the trainer binary and the operator stop endpoint. The flag
//! is checked once per tick; [`AbortSignal::aborted`] lets the loop wake
//! from the wait for the next tick boundary as soon as a stop arrives.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Request to end the session early.
#[derive(Debug, Default)]
pub struct AbortSignal {
    /// Whether an abort has been requested.
    requested: AtomicBool,

    /// Wakes tasks waiting in [`aborted`](Self::aborted).
    notify: Notify,

    /// When the first abort was requested, and by whom.
    origin: std::sync::Mutex<Option<(DateTime<Utc>, String)>>,
}

impl AbortSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort. Only the first request is remembered.
    pub fn trigger(&self, source: &str) {
        if let Ok(mut origin) = self.origin.lock() {
            origin.get_or_insert_with(|| (Utc::now(), source.to_owned()));
        }
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Check whether an abort has been requested.
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Who requested the abort, and when.
    pub fn origin(&self) -> Option<(DateTime<Utc>, String)> {
        self.origin.lock().ok().and_then(|origin| origin.clone())
    }

    /// Wait until an abort is requested.
    ///
    /// Returns immediately if one already was.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
