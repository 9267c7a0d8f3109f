//! Worker identity and slot status.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token naming one incarnation of a slot's worker.
///
/// Regenerated on every replacement and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for WorkerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a slot's worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Process started, readiness not yet reported.
    Spawning,
    /// Accepting tasks.
    Ready,
    /// Torn down; replacement pending.
    Dead,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    /// Slot index in `0..pool_size`.
    pub index: usize,
    /// Current worker incarnation, if one is running.
    pub worker: Option<WorkerIdentity>,
    /// Worker lifecycle state.
    pub status: WorkerStatus,
    /// Tasks waiting for dispatch.
    pub queued: usize,
    /// Whether a task is in flight.
    pub busy: bool,
}
