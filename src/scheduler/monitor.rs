//! Scheduler actor with the fault monitor / replacer.
//!
//! One task owns every [`Slot`] and the [`Correlator`]. It reacts to four
//! inputs: caller commands, worker events, internal timers and shutdown.
//! Because all state lives on this task, a slot's Ready → Dead transition
//! (terminate, reject active work, reject queued work, respawn) happens
//! without interleaving with any other input.
//!
//! Worker events and timers carry the worker identity or task id they were
//! created for; anything naming a replaced worker or a finished task is
//! stale and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::task::{Task, TaskOutput};
use crate::models::worker::{SlotSnapshot, WorkerIdentity, WorkerStatus};
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::scheduler::correlator::{classify_error, ActiveTask, Correlator};
use crate::scheduler::launcher::{SlotEvent, WorkerEvent, WorkerLauncher};
use crate::scheduler::router::AffinityRouter;
use crate::scheduler::slot::{PendingTask, Slot, WorkerHandle};
use crate::scheduler::Reply;
use crate::{AppError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timing knobs for the scheduler actor.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a spawning worker has to report ready.
    pub startup_timeout: Duration,
    /// Delay before retrying a launch that failed outright.
    pub respawn_backoff: Duration,
    /// How long workers get to exit on shutdown before being killed.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            respawn_backoff: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Request from a pool handle to the actor.
#[derive(Debug)]
pub enum PoolCommand {
    /// Route and run a task.
    Submit {
        /// Task to run.
        task: Task,
        /// Caller completion channel.
        reply: Reply,
    },
    /// Report every slot's state.
    Snapshot {
        /// Receives one entry per slot.
        reply: oneshot::Sender<Vec<SlotSnapshot>>,
    },
}

#[derive(Debug)]
enum TimerEvent {
    TaskDeadline { slot: usize, task_id: String },
    StartupDeadline { slot: usize, identity: WorkerIdentity },
    Respawn { slot: usize },
}

/// The scheduler actor.
pub struct Scheduler {
    settings: SchedulerSettings,
    router: AffinityRouter,
    launcher: Arc<dyn WorkerLauncher>,
    slots: Vec<Slot>,
    correlator: Correlator,
    commands: mpsc::Receiver<PoolCommand>,
    worker_tx: mpsc::Sender<SlotEvent>,
    worker_rx: mpsc::Receiver<SlotEvent>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Actor over `router.pool_size()` empty slots.
    #[must_use]
    pub fn new(
        settings: SchedulerSettings,
        router: AffinityRouter,
        launcher: Arc<dyn WorkerLauncher>,
        commands: mpsc::Receiver<PoolCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            slots: (0..router.pool_size()).map(Slot::new).collect(),
            router,
            launcher,
            correlator: Correlator::new(),
            commands,
            worker_tx,
            worker_rx,
            timer_tx,
            timer_rx,
            cancel,
        }
    }

    /// Spawn a worker per slot, then serve until cancelled or every pool
    /// handle is dropped.
    pub async fn run(mut self) {
        info!(pool_size = self.slots.len(), "scheduler starting");
        for index in 0..self.slots.len() {
            self.spawn_worker(index);
        }

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.worker_rx.recv() => self.on_worker_event(event),
                Some(timer) = self.timer_rx.recv() => self.on_timer(timer),
            }
        }

        self.shutdown();
    }

    fn on_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit { task, reply } => {
                let index = self.router.route(&task.session_id);
                debug!(
                    slot = index,
                    task_id = %task.id,
                    session_id = %task.session_id,
                    kind = ?task.kind(),
                    "task queued"
                );
                self.slots[index].enqueue(PendingTask::new(task, reply));
                self.try_dispatch(index);
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.slots.iter().map(Slot::snapshot).collect());
            }
        }
    }

    /// Send the queue head to the slot's worker if it is ready and idle.
    fn try_dispatch(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(pending) = slot.take_dispatchable() else {
            return;
        };
        let Some(worker) = slot.worker.as_ref() else {
            pending.reject(AppError::WorkerCrash("slot has no worker".into()));
            return;
        };

        let owner = worker.identity.clone();
        if let Err(err) = worker.link.send(WorkerRequest::from(&pending.task)) {
            warn!(slot = index, worker = %owner, %err, "dispatch failed");
            pending.reject(AppError::WorkerCrash(err.message().to_owned()));
            self.fail_slot(index, format!("dispatch failed: {}", err.message()));
            return;
        }

        let PendingTask { task, reply } = pending;
        slot.mark_in_flight(task.id.clone());
        let deadline = task.timeout.map(|timeout| {
            self.schedule(
                timeout,
                TimerEvent::TaskDeadline {
                    slot: index,
                    task_id: task.id.clone(),
                },
            )
        });
        debug!(slot = index, worker = %owner, task_id = %task.id, "task dispatched");
        self.correlator.register(ActiveTask {
            task,
            reply,
            slot: index,
            owner,
            started_at: Instant::now(),
            deadline,
        });
    }

    fn on_worker_event(&mut self, SlotEvent { slot, identity, event }: SlotEvent) {
        let Some(current) = self.slots.get(slot) else {
            warn!(slot, "event for unknown slot");
            return;
        };
        if !current.is_current(&identity) {
            debug!(slot, worker = %identity, ?event, "discarding event from replaced worker");
            return;
        }

        match event {
            WorkerEvent::Message(WorkerResponse::Ready { identity: reported }) => {
                self.on_ready(slot, &identity, &reported);
            }
            WorkerEvent::Message(WorkerResponse::Success { task_id, payload }) => {
                self.complete(slot, &identity, &task_id, Ok(TaskOutput::from(payload)));
            }
            WorkerEvent::Message(WorkerResponse::Error {
                task_id,
                kind,
                message,
            }) => {
                self.complete(slot, &identity, &task_id, Err(classify_error(kind, message)));
            }
            WorkerEvent::Fatal(reason) => {
                error!(slot, worker = %identity, %reason, "worker fatal error");
                self.fail_slot(slot, format!("worker fatal error: {reason}"));
            }
            WorkerEvent::Exited { code, reason } => {
                if code == Some(0) {
                    warn!(slot, worker = %identity, "worker exited cleanly while in service");
                } else {
                    error!(slot, worker = %identity, ?code, %reason, "worker exited");
                }
                self.fail_slot(slot, format!("worker exited: {reason}"));
            }
        }
    }

    fn on_ready(&mut self, index: usize, identity: &WorkerIdentity, reported: &WorkerIdentity) {
        if reported != identity {
            warn!(slot = index, worker = %identity, %reported, "worker reported a different identity");
        }
        let Some(worker) = self.slots[index].worker.as_mut() else {
            return;
        };
        if worker.status != WorkerStatus::Spawning {
            debug!(slot = index, worker = %identity, "duplicate ready ignored");
            return;
        }
        worker.status = WorkerStatus::Ready;
        if let Some(timer) = worker.startup_timer.take() {
            timer.abort();
        }
        info!(slot = index, worker = %identity, "worker ready");
        self.try_dispatch(index);
    }

    fn complete(
        &mut self,
        index: usize,
        identity: &WorkerIdentity,
        task_id: &str,
        outcome: Result<TaskOutput>,
    ) {
        let Some(active) = self.correlator.take(task_id) else {
            debug!(slot = index, worker = %identity, task_id, "discarding result for unknown task");
            return;
        };

        debug!(
            slot = index,
            worker = %identity,
            task_id,
            elapsed_ms = millis(active.elapsed()),
            ok = outcome.is_ok(),
            "task finished"
        );
        self.slots[active.slot].finish(task_id);
        let slot = active.slot;
        active.resolve(outcome);
        self.try_dispatch(slot);
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::TaskDeadline { slot, task_id } => {
                let Some(active) = self.correlator.take(&task_id) else {
                    return;
                };
                let limit = active.task.timeout.unwrap_or_default();
                warn!(
                    slot,
                    worker = %active.owner,
                    task_id = %task_id,
                    timeout_ms = millis(limit),
                    "task deadline exceeded; replacing worker"
                );
                active.reject(AppError::Timeout(format!(
                    "task did not finish within {} ms",
                    limit.as_millis()
                )));
                self.fail_slot(slot, "worker replaced after task timeout".into());
            }
            TimerEvent::StartupDeadline { slot, identity } => {
                let spawning = self.slots[slot].worker.as_ref().is_some_and(|worker| {
                    worker.identity == identity && worker.status == WorkerStatus::Spawning
                });
                if spawning {
                    warn!(slot, worker = %identity, "worker did not become ready in time");
                    self.fail_slot(slot, "worker did not become ready in time".into());
                }
            }
            TimerEvent::Respawn { slot } => {
                if self.slots[slot].worker.is_none() {
                    self.spawn_worker(slot);
                }
            }
        }
    }

    /// Ready → Dead: tear the slot down and start a replacement.
    fn fail_slot(&mut self, index: usize, cause: String) {
        let slot = &mut self.slots[index];
        let Some(mut worker) = slot.worker.take() else {
            return;
        };
        if let Some(timer) = worker.startup_timer.take() {
            timer.abort();
        }
        let was_ready = worker.status == WorkerStatus::Ready;
        worker.status = WorkerStatus::Dead;
        worker.link.terminate();
        slot.clear_in_flight();

        let active = self.correlator.take_owned_by(&worker.identity);
        let queued = slot.drain_queue();
        info!(
            slot = index,
            worker = %worker.identity,
            %cause,
            rejected_active = active.len(),
            rejected_queued = queued.len(),
            "slot failed; replacing worker"
        );
        for task in active {
            task.reject(AppError::WorkerCrash(cause.clone()));
        }
        for pending in queued {
            pending.reject(AppError::WorkerCrash(format!(
                "worker crashed before dispatch: {cause}"
            )));
        }

        if was_ready {
            self.spawn_worker(index);
        } else {
            // Died before ready; retry after the backoff.
            self.schedule(
                self.settings.respawn_backoff,
                TimerEvent::Respawn { slot: index },
            );
        }
    }

    fn spawn_worker(&mut self, index: usize) {
        let identity = WorkerIdentity::generate();
        match self
            .launcher
            .launch(index, identity.clone(), self.worker_tx.clone())
        {
            Ok(link) => {
                let startup_timer = self.schedule(
                    self.settings.startup_timeout,
                    TimerEvent::StartupDeadline {
                        slot: index,
                        identity: identity.clone(),
                    },
                );
                info!(slot = index, worker = %identity, "worker spawning");
                self.slots[index].worker = Some(WorkerHandle {
                    identity,
                    status: WorkerStatus::Spawning,
                    link,
                    startup_timer: Some(startup_timer),
                });
            }
            Err(err) => {
                error!(
                    slot = index,
                    %err,
                    retry_ms = millis(self.settings.respawn_backoff),
                    "worker launch failed"
                );
                for pending in self.slots[index].drain_queue() {
                    pending.reject(AppError::WorkerCrash(format!(
                        "worker launch failed: {}",
                        err.message()
                    )));
                }
                self.schedule(
                    self.settings.respawn_backoff,
                    TimerEvent::Respawn { slot: index },
                );
            }
        }
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) -> AbortHandle {
        let timers = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(event);
        })
        .abort_handle()
    }

    fn shutdown(&mut self) {
        info!("scheduler shutting down");
        for slot in &mut self.slots {
            if let Some(mut worker) = slot.worker.take() {
                if let Some(timer) = worker.startup_timer.take() {
                    timer.abort();
                }
                worker.link.shutdown(self.settings.shutdown_grace);
            }
            slot.clear_in_flight();
            for pending in slot.drain_queue() {
                pending.reject(AppError::Internal("pool shutting down".into()));
            }
        }
        for active in self.correlator.drain() {
            active.reject(AppError::Internal("pool shutting down".into()));
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
