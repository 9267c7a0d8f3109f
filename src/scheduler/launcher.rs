//! Worker launching and the process-backed worker link.
//!
//! [`ProcessLauncher`] starts `sandpool-worker` processes with:
//! - `kill_on_drop(true)` so a forgotten child never outlives its handle.
//! - `env_clear()` plus [`ALLOWED_ENV_VARS`] so server secrets stay out of
//!   sandboxed code.
//! - Reader, writer, stderr forwarder and exit monitor tasks feeding a
//!   single [`SlotEvent`] channel.
//!
//! Termination is fire-and-forget: [`WorkerLink::terminate`] only signals
//! the exit monitor, which kills and reaps the child in the background and
//! reports nothing.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::models::worker::WorkerIdentity;
use crate::protocol::reader::{run_reader, ReaderExit};
use crate::protocol::writer::run_writer;
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::{AppError, Result};

/// Environment variables inherited by worker processes.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "TMPDIR",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
];

/// Something that happened to one worker incarnation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A protocol message from the worker.
    Message(WorkerResponse),
    /// The worker's output stream failed irrecoverably.
    Fatal(String),
    /// The worker process exited.
    Exited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Human-readable cause.
        reason: String,
    },
}

/// A [`WorkerEvent`] tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEvent {
    /// Slot the worker was launched for.
    pub slot: usize,
    /// Incarnation that produced the event.
    pub identity: WorkerIdentity,
    /// What happened.
    pub event: WorkerEvent,
}

/// Scheduler-side handle to one running worker.
pub trait WorkerLink: Send {
    /// Queue a request for the worker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::WorkerCrash` if the worker can no longer receive.
    fn send(&self, request: WorkerRequest) -> Result<()>;

    /// Stop the worker now. Must not block and must not produce an event.
    fn terminate(&mut self);

    /// Ask the worker to finish and exit, forcing termination after
    /// `grace`.
    fn shutdown(&mut self, grace: Duration) {
        let _ = grace;
        self.terminate();
    }
}

/// Starts worker incarnations for slots.
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `slot` with `identity`, reporting through `events`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::WorkerCrash` if the worker cannot be started.
    fn launch(
        &self,
        slot: usize,
        identity: WorkerIdentity,
        events: mpsc::Sender<SlotEvent>,
    ) -> Result<Box<dyn WorkerLink>>;
}

/// Launch parameters for worker processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Worker executable.
    pub binary: PathBuf,
    /// Parent of every slot's sandbox directory.
    pub workspace_root: PathBuf,
    /// Per-worker session capacity.
    pub capacity: usize,
    /// Session lifetime in seconds.
    pub ttl_seconds: u64,
    /// Expired-session sweep period in seconds.
    pub sweep_seconds: u64,
    /// Interpreter extensions.
    pub extensions: Vec<String>,
}

impl ProcessLauncher {
    /// Launcher configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the worker binary cannot be located.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        Ok(Self {
            binary: config.worker_binary()?,
            workspace_root: config.workspace_root.clone(),
            capacity: config.sessions.capacity,
            ttl_seconds: config.sessions.ttl_seconds,
            sweep_seconds: config.sessions.sweep_interval_seconds,
            extensions: config.extensions.clone(),
        })
    }

    fn command(&self, slot: usize, identity: &WorkerIdentity) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--slot")
            .arg(slot.to_string())
            .arg("--identity")
            .arg(identity.as_str())
            .arg("--sandbox-root")
            .arg(self.workspace_root.join(format!("slot-{slot}")))
            .arg("--capacity")
            .arg(self.capacity.to_string())
            .arg("--ttl-seconds")
            .arg(self.ttl_seconds.to_string())
            .arg("--sweep-seconds")
            .arg(self.sweep_seconds.to_string());
        if !self.extensions.is_empty() {
            cmd.arg("--extensions").arg(self.extensions.join(","));
        }

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.current_dir(&self.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        slot: usize,
        identity: WorkerIdentity,
        events: mpsc::Sender<SlotEvent>,
    ) -> Result<Box<dyn WorkerLink>> {
        let mut child = self.command(slot, &identity).spawn().map_err(|err| {
            AppError::WorkerCrash(format!(
                "failed to spawn worker {}: {err}",
                self.binary.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::WorkerCrash("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::WorkerCrash("failed to capture worker stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::WorkerCrash("failed to capture worker stderr".into()))?;

        info!(slot, worker = %identity, pid = ?child.id(), "worker process spawned");

        let label = format!("slot-{slot}/{identity}");
        let cancel = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::unbounded_channel::<WorkerRequest>();

        let writer_label = label.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = run_writer(writer_label.clone(), stdin, request_rx, writer_cancel).await
            {
                debug!(label = writer_label, %err, "worker stdin closed");
            }
        });

        let reader_events = events.clone();
        let reader_identity = identity.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let wrap_identity = reader_identity.clone();
            let exit = run_reader(
                label,
                stdout,
                reader_events.clone(),
                move |message| SlotEvent {
                    slot,
                    identity: wrap_identity.clone(),
                    event: WorkerEvent::Message(message),
                },
                reader_cancel,
            )
            .await;
            if let ReaderExit::Failed(reason) = exit {
                let event = SlotEvent {
                    slot,
                    identity: reader_identity,
                    event: WorkerEvent::Fatal(reason),
                };
                let _ = reader_events.send(event).await;
            }
        });

        tokio::spawn(forward_stderr(slot, identity.clone(), stderr));
        tokio::spawn(monitor_exit(slot, identity, child, events, cancel.clone()));

        Ok(Box::new(ProcessLink {
            requests: Some(request_tx),
            cancel,
        }))
    }
}

/// [`WorkerLink`] over a child process.
#[derive(Debug)]
pub struct ProcessLink {
    requests: Option<mpsc::UnboundedSender<WorkerRequest>>,
    cancel: CancellationToken,
}

impl WorkerLink for ProcessLink {
    fn send(&self, request: WorkerRequest) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| AppError::WorkerCrash("worker link closed".into()))?;
        requests
            .send(request)
            .map_err(|_| AppError::WorkerCrash("worker stdin closed".into()))
    }

    fn terminate(&mut self) {
        self.requests = None;
        self.cancel.cancel();
    }

    fn shutdown(&mut self, grace: Duration) {
        // Dropping the sender closes the worker's stdin, which it treats
        // as an orderly stop.
        self.requests = None;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            cancel.cancel();
        });
    }
}

async fn forward_stderr(slot: usize, identity: WorkerIdentity, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(slot, worker = %identity, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(slot, worker = %identity, %err, "worker stderr unreadable");
                break;
            }
        }
    }
}

/// Await child exit and report it, unless `cancel` fires first; then kill
/// and reap the child without reporting.
async fn monitor_exit(
    slot: usize,
    identity: WorkerIdentity,
    mut child: Child,
    events: mpsc::Sender<SlotEvent>,
    cancel: CancellationToken,
) {
    tokio::select! {
        result = child.wait() => {
            let (code, reason) = match result {
                Ok(status) => {
                    let code = status.code();
                    let reason = code.map_or_else(
                        || "process terminated by signal".to_owned(),
                        |c| format!("process exited with code {c}"),
                    );
                    (code, reason)
                }
                Err(err) => {
                    warn!(slot, worker = %identity, %err, "error waiting for worker process");
                    (None, format!("wait error: {err}"))
                }
            };

            let event = SlotEvent {
                slot,
                identity: identity.clone(),
                event: WorkerEvent::Exited { code, reason },
            };
            if events.send(event).await.is_err() {
                debug!(slot, worker = %identity, "scheduler gone before exit was reported");
            }
        }
        () = cancel.cancelled() => {
            if let Err(err) = child.start_kill() {
                warn!(slot, worker = %identity, %err, "failed to kill worker process");
            }
            match child.wait().await {
                Ok(status) => debug!(slot, worker = %identity, %status, "terminated worker reaped"),
                Err(err) => warn!(slot, worker = %identity, %err, "failed to reap worker process"),
            }
        }
    }
}
