//! Per-slot FIFO queue and worker handle.

use std::collections::VecDeque;

use tokio::task::AbortHandle;

use crate::models::task::{Task, TaskId, TaskOutput};
use crate::models::worker::{SlotSnapshot, WorkerIdentity, WorkerStatus};
use crate::scheduler::launcher::WorkerLink;
use crate::scheduler::Reply;
use crate::{AppError, Result};

/// A task waiting for dispatch together with its caller.
#[derive(Debug)]
pub struct PendingTask {
    /// The routed task.
    pub task: Task,
    /// Caller completion channel.
    pub reply: Reply,
}

impl PendingTask {
    /// Wrap a task and its reply channel.
    #[must_use]
    pub fn new(task: Task, reply: Reply) -> Self {
        Self { task, reply }
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

/// The live worker occupying a slot.
pub struct WorkerHandle {
    /// Incarnation token.
    pub identity: WorkerIdentity,
    /// Spawning until the worker reports ready.
    pub status: WorkerStatus,
    /// Request channel and process control.
    pub link: Box<dyn WorkerLink>,
    /// Pending startup deadline while spawning.
    pub startup_timer: Option<AbortHandle>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("identity", &self.identity)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// One position in the pool: a worker (or none while replacement is
/// pending), its FIFO queue and the single task in flight.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    /// Current worker; `None` means Dead with a respawn pending.
    pub worker: Option<WorkerHandle>,
    queue: VecDeque<PendingTask>,
    in_flight: Option<TaskId>,
}

impl Slot {
    /// Empty slot with no worker.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            worker: None,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Slot index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity of the current worker, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&WorkerIdentity> {
        self.worker.as_ref().map(|worker| &worker.identity)
    }

    /// Whether `identity` names the current worker.
    #[must_use]
    pub fn is_current(&self, identity: &WorkerIdentity) -> bool {
        self.identity() == Some(identity)
    }

    /// Append to the back of the queue.
    pub fn enqueue(&mut self, pending: PendingTask) {
        self.queue.push_back(pending);
    }

    /// Tasks waiting for dispatch.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Task currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    /// Pop the queue head iff the worker is ready and nothing is in flight.
    pub fn take_dispatchable(&mut self) -> Option<PendingTask> {
        let ready = self
            .worker
            .as_ref()
            .is_some_and(|worker| worker.status == WorkerStatus::Ready);
        if !ready || self.in_flight.is_some() {
            return None;
        }
        self.queue.pop_front()
    }

    /// Record `task_id` as in flight.
    pub fn mark_in_flight(&mut self, task_id: TaskId) {
        self.in_flight = Some(task_id);
    }

    /// Clear the in-flight marker if it names `task_id`.
    pub fn finish(&mut self, task_id: &str) -> bool {
        if self.in_flight.as_deref() == Some(task_id) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Forget the in-flight task unconditionally.
    pub fn clear_in_flight(&mut self) {
        self.in_flight = None;
    }

    /// Remove every queued task, oldest first.
    pub fn drain_queue(&mut self) -> Vec<PendingTask> {
        self.queue.drain(..).collect()
    }

    /// Point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            index: self.index,
            worker: self.identity().cloned(),
            status: self
                .worker
                .as_ref()
                .map_or(WorkerStatus::Dead, |worker| worker.status),
            queued: self.queue.len(),
            busy: self.in_flight.is_some(),
        }
    }
}
