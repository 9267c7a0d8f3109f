//! Task correlator: in-flight tasks keyed by task id.
//!
//! Terminal worker messages are matched back to their caller here. A
//! message whose task id is unknown (already timed out, or from a replaced
//! worker) is discarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

use crate::errors::ErrorKind;
use crate::models::task::{Task, TaskOutput};
use crate::models::worker::WorkerIdentity;
use crate::scheduler::Reply;
use crate::{AppError, Result};

/// A dispatched task awaiting its terminal message.
#[derive(Debug)]
pub struct ActiveTask {
    /// The dispatched task.
    pub task: Task,
    /// Caller completion channel.
    pub reply: Reply,
    /// Slot the task was dispatched on.
    pub slot: usize,
    /// Worker incarnation the task was sent to.
    pub owner: WorkerIdentity,
    /// Dispatch instant.
    pub started_at: Instant,
    /// Pending deadline timer, if the task has one.
    pub deadline: Option<AbortHandle>,
}

impl ActiveTask {
    /// Time since dispatch.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Deliver a terminal outcome. A caller that gave up is ignored.
    pub fn resolve(self, outcome: Result<TaskOutput>) {
        let _ = self.reply.send(outcome);
    }

    /// Reject with `err`.
    pub fn reject(self, err: AppError) {
        self.resolve(Err(err));
    }
}

/// Registry of active tasks.
#[derive(Debug, Default)]
pub struct Correlator {
    active: HashMap<String, ActiveTask>,
}

impl Correlator {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no task is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether `task_id` is active.
    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    /// Register a dispatched task.
    pub fn register(&mut self, active: ActiveTask) {
        self.active.insert(active.task.id.clone(), active);
    }

    /// Remove an active task, cancelling its deadline timer.
    pub fn take(&mut self, task_id: &str) -> Option<ActiveTask> {
        let mut active = self.active.remove(task_id)?;
        if let Some(timer) = active.deadline.take() {
            timer.abort();
        }
        Some(active)
    }

    /// Remove every task owned by `owner`, cancelling their timers.
    pub fn take_owned_by(&mut self, owner: &WorkerIdentity) -> Vec<ActiveTask> {
        let ids: Vec<String> = self
            .active
            .iter()
            .filter(|(_, active)| &active.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| self.take(id)).collect()
    }

    /// Remove every active task.
    pub fn drain(&mut self) -> Vec<ActiveTask> {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        ids.iter().filter_map(|id| self.take(id)).collect()
    }
}

/// Rebuild a worker-reported error.
///
/// The structured `kind` wins; without one the message is inspected and
/// anything mentioning "not found" becomes [`AppError::NotFound`].
#[must_use]
pub fn classify_error(kind: Option<ErrorKind>, message: String) -> AppError {
    match kind {
        Some(kind) => AppError::from_kind(kind, message),
        None if message.to_ascii_lowercase().contains("not found") => {
            AppError::NotFound(message)
        }
        None => AppError::Internal(message),
    }
}
