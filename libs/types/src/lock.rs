//! Pause lock records
//!
//! One record per `LockId`. The serialized form is exactly
//! `{"lock": bool, "stop": bool}`; the creation time stays in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pause/stop state of one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The call site is held.
    pub lock: bool,
    /// The operator asked the call site to stop.
    pub stop: bool,
    /// When this record was created; not part of the wire shape.
    #[serde(skip, default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(lock: bool, stop: bool) -> Self {
        Self {
            lock,
            stop,
            created_at: Utc::now(),
        }
    }

    /// Record created when a debugged process pauses itself.
    pub fn paused() -> Self {
        Self::new(true, false)
    }

    /// Record produced by an acquire: held and told to stop.
    pub fn stopped() -> Self {
        Self::new(true, true)
    }

    /// Same flags, ignoring creation time.
    pub fn same_state(&self, other: &LockRecord) -> bool {
        self.lock == other.lock && self.stop == other.stop
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
