//! Heartbeat transport between a worker and the monitor.
//!
//! Each in-flight item gets one `watch` channel. The worker owns the only
//! `Heartbeat` (single writer); the monitor holds the `HeartbeatReader` and
//! always sees the latest record. Dropping the reader on completion deletes
//! the record. Heartbeats drive stall detection only and never decide an
//! item's result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::ItemId;

/// The latest liveness signal of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub item_id: ItemId,
    pub updated_at: DateTime<Utc>,
    pub note: Option<String>,
    #[serde(skip)]
    seen: Instant,
}

impl HeartbeatRecord {
    fn new(item_id: ItemId, note: Option<String>) -> Self {
        Self {
            item_id,
            updated_at: Utc::now(),
            note,
            seen: Instant::now(),
        }
    }

    /// Time since this record was written, on the monotonic clock.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.seen)
    }
}

/// Write half, owned by the worker.
#[derive(Debug)]
pub struct Heartbeat {
    item_id: ItemId,
    tx: watch::Sender<Option<HeartbeatRecord>>,
}

impl Heartbeat {
    pub fn beat(&self, note: impl Into<String>) {
        let record = HeartbeatRecord::new(self.item_id.clone(), Some(note.into()));
        self.tx.send_replace(Some(record));
    }
}

/// Read half, owned by the monitor.
#[derive(Debug)]
pub struct HeartbeatReader {
    rx: watch::Receiver<Option<HeartbeatRecord>>,
}

impl HeartbeatReader {
    /// Latest record, or `None` while the worker is still queued for a slot.
    pub fn latest(&self) -> Option<HeartbeatRecord> {
        self.rx.borrow().clone()
    }

    /// The latest record if it changed since the last call.
    pub fn take_changed(&mut self) -> Option<HeartbeatRecord> {
        if self.rx.has_changed().unwrap_or(false) {
            self.rx.borrow_and_update().clone()
        } else {
            None
        }
    }
}

/// Create a heartbeat channel for one item. No record exists until the
/// worker's first beat.
pub fn channel(item_id: ItemId) -> (Heartbeat, HeartbeatReader) {
    let (tx, rx) = watch::channel(None);
    (Heartbeat { item_id, tx }, HeartbeatReader { rx })
}
