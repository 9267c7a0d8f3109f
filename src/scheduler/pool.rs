//! Public handle over the scheduler actor.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::task::{ExecutionOutput, Task, TaskOutput, TaskPayload};
use crate::models::worker::SlotSnapshot;
use crate::scheduler::launcher::{ProcessLauncher, WorkerLauncher};
use crate::scheduler::monitor::{PoolCommand, Scheduler, SchedulerSettings};
use crate::scheduler::router::AffinityRouter;
use crate::{AppError, Result};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Pool-wide settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of slots.
    pub pool_size: NonZeroUsize,
    /// Actor timing.
    pub scheduler: SchedulerSettings,
    /// Deadline for `execute_code` when the caller gives none.
    pub execute_timeout: Duration,
    /// Deadline for create, upload and download tasks.
    pub file_timeout: Option<Duration>,
}

impl PoolSettings {
    /// Settings derived from `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `pool_size` is zero.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let pool_size = NonZeroUsize::new(config.pool_size)
            .ok_or_else(|| AppError::Config("pool_size must be greater than zero".into()))?;
        Ok(Self {
            pool_size,
            scheduler: SchedulerSettings {
                startup_timeout: config.timeouts.startup(),
                respawn_backoff: config.timeouts.respawn_backoff(),
                ..SchedulerSettings::default()
            },
            execute_timeout: config.timeouts.execute(),
            file_timeout: config.timeouts.file(),
        })
    }
}

/// Cloneable handle for submitting session operations.
///
/// Every call is routed to the session's home slot and resolves exactly
/// once with the task's terminal outcome.
#[derive(Debug, Clone)]
pub struct SessionPool {
    commands: mpsc::Sender<PoolCommand>,
    router: AffinityRouter,
    execute_timeout: Duration,
    file_timeout: Option<Duration>,
}

impl SessionPool {
    /// Start the scheduler actor with `launcher` and spawn one worker per
    /// slot. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(
        settings: PoolSettings,
        launcher: Arc<dyn WorkerLauncher>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let router = AffinityRouter::new(settings.pool_size);
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let scheduler = Scheduler::new(settings.scheduler, router, launcher, command_rx, cancel);
        let actor = tokio::spawn(scheduler.run());
        (
            Self {
                commands,
                router,
                execute_timeout: settings.execute_timeout,
                file_timeout: settings.file_timeout,
            },
            actor,
        )
    }

    /// Start a pool of worker processes as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for invalid settings or a worker binary
    /// that cannot be located.
    pub fn from_config(
        config: &GlobalConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let settings = PoolSettings::from_config(config)?;
        let launcher = ProcessLauncher::from_config(config)?;
        Ok(Self::start(settings, Arc::new(launcher), cancel))
    }

    /// Slot that owns `session_id`.
    #[must_use]
    pub fn slot_for(&self, session_id: &str) -> usize {
        self.router.route(session_id)
    }

    /// Create a session on its home worker and return its id.
    ///
    /// # Errors
    ///
    /// Fails with the worker's error, `WorkerCrash` or `Timeout`.
    pub async fn create_session(&self) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let task = Task::new(session_id, TaskPayload::CreateSession, self.file_timeout);
        match self.submit(task).await? {
            TaskOutput::SessionCreated(id) => Ok(id),
            other => Err(unexpected("session_created", &other)),
        }
    }

    /// Store `content` as `filename` in the session workspace.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad filename, `NotFound` for an unknown session.
    pub async fn upload_file(
        &self,
        session_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let payload = TaskPayload::UploadFile {
            filename: filename.to_owned(),
            content,
        };
        let task = Task::new(session_id.to_owned(), payload, self.file_timeout);
        match self.submit(task).await? {
            TaskOutput::FileUploaded(name) => Ok(name),
            other => Err(unexpected("file_uploaded", &other)),
        }
    }

    /// Evaluate `code` in the session's interpreter state.
    ///
    /// Interpreter errors come back inside [`ExecutionOutput::error`].
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown session, `Timeout` when `timeout` (or the
    /// configured default) elapses; the slot's worker is replaced in that
    /// case.
    pub async fn execute_code(
        &self,
        session_id: &str,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput> {
        let payload = TaskPayload::ExecuteCode {
            code: code.to_owned(),
        };
        let timeout = timeout.unwrap_or(self.execute_timeout);
        let task = Task::new(session_id.to_owned(), payload, Some(timeout));
        match self.submit(task).await? {
            TaskOutput::Executed(output) => Ok(output),
            other => Err(unexpected("executed", &other)),
        }
    }

    /// Read a file from the session workspace.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown session or missing file, `PathTraversal`
    /// if the path leaves the workspace.
    pub async fn download_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        let payload = TaskPayload::DownloadFile {
            path: path.to_owned(),
        };
        let task = Task::new(session_id.to_owned(), payload, self.file_timeout);
        match self.submit(task).await? {
            TaskOutput::FileDownloaded(content) => Ok(content),
            other => Err(unexpected("file_downloaded", &other)),
        }
    }

    /// Current state of every slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` once the pool has shut down.
    pub async fn snapshot(&self) -> Result<Vec<SlotSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Snapshot { reply })
            .await
            .map_err(|_| pool_gone())?;
        rx.await.map_err(|_| pool_gone())
    }

    async fn submit(&self, task: Task) -> Result<TaskOutput> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Submit { task, reply })
            .await
            .map_err(|_| pool_gone())?;
        rx.await.map_err(|_| pool_gone())?
    }
}

fn pool_gone() -> AppError {
    AppError::Internal("pool shut down".into())
}

fn unexpected(expected: &str, got: &TaskOutput) -> AppError {
    AppError::Protocol(format!("expected {expected} payload, got {got:?}"))
}
