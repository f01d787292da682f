//! Recording file entries.
//!
//! A recording is an append-only sequence of JSON lines: one `header`, one
//! `frame` per completed tick in tick order, and a `trailer` when the
//! session closed cleanly. Each line is a complete entry, so a reader can
//! replay a truncated file up to its last full line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, Tick};
use crate::structs::Snapshot;

/// One line of a recording file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum RecordEntry {
    /// Written once when the sink is opened.
    Header {
        /// Session being recorded.
        session: SessionId,
        /// Map being played.
        map: String,
        /// Ticks per second.
        tick_rate: u32,
        /// Wall-clock time the recording started.
        started_at: DateTime<Utc>,
    },
    /// One completed tick.
    Frame {
        /// Tick number, strictly increasing across frames.
        tick: Tick,
        /// Snapshot taken after the tick advanced.
        snapshot: Snapshot,
    },
    /// Written once when the sink is finalized.
    Trailer {
        /// Number of frames written.
        frames: u64,
        /// Wall-clock time the recording ended.
        ended_at: DateTime<Utc>,
    },
}

impl RecordEntry {
    /// Return the tick of a frame entry.
    pub const fn tick(&self) -> Option<Tick> {
        match self {
            Self::Frame { tick, .. } => Some(*tick),
            Self::Header { .. } | Self::Trailer { .. } => None,
        }
    }
}
