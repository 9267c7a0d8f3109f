//! Worker core: owns one interpreter and serves scheduler requests.
//!
//! Requests are handled on a single thread inside a
//! [`tokio::task::LocalSet`]. Each request runs as its own local task, so a
//! request waiting for the mount lock never blocks reading the next line.
//! Upload, execute and download share one FIFO lock because the interpreter
//! has a single global filesystem view: the lock covers the whole
//! mount → chdir → work → chdir / → unmount region.

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::worker::WorkerIdentity;
use crate::protocol::reader::{run_reader, ReaderExit};
use crate::protocol::writer::run_writer;
use crate::protocol::{SuccessPayload, WorkerRequest, WorkerResponse};
use crate::worker::engine::{SandboxEngine, StateHandle};
use crate::worker::sandbox::{
    resolve_download_path, validate_filename, SessionWorkspace, SCRATCH_MOUNT, WORKSPACE_MOUNT,
};
use crate::worker::session_store::{Session, SessionStore};
use crate::{AppError, Result};

/// Startup parameters for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Slot index this worker serves.
    pub slot: usize,
    /// Identity assigned by the scheduler; echoed in the ready message.
    pub identity: WorkerIdentity,
    /// Slot directory; the worker works inside `<sandbox_root>/<identity>`.
    pub sandbox_root: PathBuf,
    /// Maximum live sessions.
    pub capacity: usize,
    /// Session lifetime from creation.
    pub ttl: Duration,
    /// Period of the expired-session sweep.
    pub sweep_interval: Duration,
    /// Interpreter extensions to enable.
    pub extensions: Vec<String>,
}

/// A worker bound to one interpreter engine.
pub struct Worker<E: SandboxEngine> {
    settings: WorkerSettings,
    engine: RefCell<E>,
    store: RefCell<SessionStore>,
    mount_lock: Mutex<()>,
    sessions_dir: PathBuf,
}

impl<E: SandboxEngine> Worker<E> {
    /// Prepare the sandbox directories and the interpreter.
    ///
    /// Directories left behind by earlier incarnations of the same slot are
    /// removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be prepared, the engine
    /// fails to start, or an extension is unknown.
    pub fn initialize(settings: WorkerSettings, mut engine: E) -> Result<Rc<Self>> {
        fs::create_dir_all(&settings.sandbox_root).map_err(|err| {
            AppError::Io(format!(
                "create sandbox root {}: {err}",
                settings.sandbox_root.display()
            ))
        })?;
        purge_stale_incarnations(&settings);

        let base = settings.sandbox_root.join(settings.identity.as_str());
        let sessions_dir = base.join("sessions");
        let scratch_dir = base.join("scratch");
        for dir in [&sessions_dir, &scratch_dir] {
            fs::create_dir_all(dir)
                .map_err(|err| AppError::Io(format!("create {}: {err}", dir.display())))?;
        }

        engine.initialize()?;
        engine.load_extensions(&settings.extensions)?;
        engine.mount(SCRATCH_MOUNT, &scratch_dir)?;

        info!(
            slot = settings.slot,
            worker = %settings.identity,
            extensions = ?settings.extensions,
            "worker initialized"
        );

        Ok(Rc::new(Self {
            store: RefCell::new(SessionStore::new(settings.capacity, settings.ttl)),
            settings,
            engine: RefCell::new(engine),
            mount_lock: Mutex::new(()),
            sessions_dir,
        }))
    }

    /// Identity this worker reports.
    #[must_use]
    pub fn identity(&self) -> &WorkerIdentity {
        &self.settings.identity
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.store.borrow().len()
    }

    /// Handle one request and build its response.
    pub async fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        let task_id = request.task_id().to_owned();
        let outcome = match request {
            WorkerRequest::CreateSession { session_id, .. } => self.create_session(&session_id),
            WorkerRequest::UploadFile {
                session_id,
                filename,
                content,
                ..
            } => self.upload_file(&session_id, &filename, &content).await,
            WorkerRequest::ExecuteCode {
                session_id, code, ..
            } => self.execute_code(&session_id, &code).await,
            WorkerRequest::DownloadFile {
                session_id, path, ..
            } => self.download_file(&session_id, &path).await,
        };

        match outcome {
            Ok(payload) => WorkerResponse::Success { task_id, payload },
            Err(err) => {
                debug!(task_id, error = %err, "request failed");
                WorkerResponse::Error {
                    task_id,
                    kind: Some(err.kind()),
                    message: err.message().to_owned(),
                }
            }
        }
    }

    fn create_session(&self, session_id: &str) -> Result<SuccessPayload> {
        let now = Instant::now();
        self.release_expired(now);

        let state = self.engine.borrow_mut().new_global_state()?;
        let workspace = match SessionWorkspace::create(&self.sessions_dir, session_id) {
            Ok(workspace) => workspace,
            Err(err) => {
                self.engine.borrow_mut().destroy_global_state(state);
                return Err(err);
            }
        };

        let session = Session {
            id: session_id.to_owned(),
            state,
            workspace,
            created_at: Utc::now(),
        };
        let displaced = self.store.borrow_mut().insert(session, now);
        for old in displaced {
            debug!(session_id = %old.id, "evicting session");
            self.release(old);
        }

        debug!(session_id, "session created");
        Ok(SuccessPayload::SessionCreated {
            session_id: session_id.to_owned(),
        })
    }

    async fn upload_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<SuccessPayload> {
        validate_filename(filename)?;
        let _region = self.mount_lock.lock().await;
        let (_, workspace) = self.lookup(session_id)?;

        let mut engine = self.engine.borrow_mut();
        with_workspace(&mut *engine, &workspace, |engine| {
            engine.write_file(&format!("{WORKSPACE_MOUNT}/{filename}"), content)
        })?;

        debug!(session_id, filename, bytes = content.len(), "file uploaded");
        Ok(SuccessPayload::FileUploaded {
            filename: filename.to_owned(),
        })
    }

    async fn execute_code(&self, session_id: &str, code: &str) -> Result<SuccessPayload> {
        let _region = self.mount_lock.lock().await;
        let (state, workspace) = self.lookup(session_id)?;

        let mut engine = self.engine.borrow_mut();
        let output = with_workspace(&mut *engine, &workspace, |engine| engine.run(code, state))?;

        Ok(SuccessPayload::Executed {
            result: output.result,
            stdout: output.stdout,
            error: output.error,
        })
    }

    async fn download_file(&self, session_id: &str, path: &str) -> Result<SuccessPayload> {
        let virtual_path = resolve_download_path(path)?;
        let _region = self.mount_lock.lock().await;
        let (_, workspace) = self.lookup(session_id)?;

        let mut engine = self.engine.borrow_mut();
        let content = with_workspace(&mut *engine, &workspace, |engine| {
            if !engine.exists(&virtual_path)? {
                return Err(AppError::NotFound(format!("file {path}")));
            }
            engine.read_file(&virtual_path)
        })?;

        Ok(SuccessPayload::FileDownloaded { content })
    }

    fn lookup(&self, session_id: &str) -> Result<(StateHandle, PathBuf)> {
        let now = Instant::now();
        self.release_expired(now);
        self.store
            .borrow_mut()
            .get(session_id, now)
            .map(|session| (session.state, session.workspace.to_path_buf()))
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    /// Release every session whose lifetime has ended.
    pub fn release_expired(&self, now: Instant) {
        let expired = self.store.borrow_mut().purge_expired(now);
        for session in expired {
            debug!(session_id = %session.id, "session expired");
            self.release(session);
        }
    }

    /// Release every session.
    pub fn shutdown(&self) {
        let sessions = self.store.borrow_mut().drain();
        let count = sessions.len();
        for session in sessions {
            self.release(session);
        }
        info!(worker = %self.settings.identity, released = count, "worker shut down");
    }

    fn release(&self, session: Session) {
        self.engine.borrow_mut().destroy_global_state(session.state);
        if let Err(err) = session.workspace.remove() {
            warn!(session_id = %session.id, %err, "failed to remove session workspace");
        }
    }
}

/// Run `work` with `host` mounted as the working directory.
///
/// The mount is undone whether or not `work` succeeds.
fn with_workspace<E, T>(
    engine: &mut E,
    host: &std::path::Path,
    work: impl FnOnce(&mut E) -> Result<T>,
) -> Result<T>
where
    E: SandboxEngine,
{
    engine.mount(WORKSPACE_MOUNT, host)?;
    if let Err(err) = engine.chdir(WORKSPACE_MOUNT) {
        if let Err(unmount_err) = engine.unmount(WORKSPACE_MOUNT) {
            warn!(%unmount_err, "failed to unmount workspace");
        }
        return Err(err);
    }

    let outcome = work(engine);

    if let Err(err) = engine.chdir("/") {
        warn!(%err, "failed to leave workspace");
    }
    if let Err(err) = engine.unmount(WORKSPACE_MOUNT) {
        warn!(%err, "failed to unmount workspace");
    }
    outcome
}

fn purge_stale_incarnations(settings: &WorkerSettings) {
    let Ok(entries) = fs::read_dir(&settings.sandbox_root) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy() == settings.identity.as_str() {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if let Err(err) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), %err, "failed to remove stale sandbox");
            } else {
                debug!(path = %path.display(), "removed stale sandbox");
            }
        }
    }
}

/// Serve requests from `input` and write responses to `output` until input
/// ends or `cancel` fires.
///
/// Announces readiness before reading anything. Must run inside a
/// [`tokio::task::LocalSet`].
///
/// # Errors
///
/// Returns an error if the response stream fails.
pub async fn serve<E, R, W>(
    worker: Rc<Worker<E>>,
    input: R,
    output: W,
    cancel: CancellationToken,
) -> Result<()>
where
    E: SandboxEngine + 'static,
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let label = format!("slot-{}/{}", worker.settings.slot, worker.identity());

    let (response_tx, response_rx) = mpsc::unbounded_channel::<WorkerResponse>();
    let writer = tokio::task::spawn_local(run_writer(
        label.clone(),
        output,
        response_rx,
        CancellationToken::new(),
    ));

    let (request_tx, mut request_rx) = mpsc::channel::<WorkerRequest>(64);
    let reader = tokio::task::spawn_local(run_reader(
        label.clone(),
        input,
        request_tx,
        |request| request,
        cancel.clone(),
    ));

    if response_tx
        .send(WorkerResponse::Ready {
            identity: worker.identity().clone(),
        })
        .is_err()
    {
        return Err(AppError::Protocol("response channel closed".into()));
    }

    let mut sweep = tokio::time::interval(worker.settings.sweep_interval);
    sweep.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            request = request_rx.recv() => {
                let Some(request) = request else { break };
                let worker = Rc::clone(&worker);
                let responses = response_tx.clone();
                tokio::task::spawn_local(async move {
                    let response = worker.handle(request).await;
                    if responses.send(response).is_err() {
                        debug!("response dropped; writer closed");
                    }
                });
            }
            _ = sweep.tick() => worker.release_expired(Instant::now()),
        }
    }

    match reader.await {
        Ok(ReaderExit::Failed(reason)) => warn!(%label, %reason, "request stream failed"),
        Ok(exit) => debug!(%label, ?exit, "request stream closed"),
        Err(err) => warn!(%label, %err, "reader task failed"),
    }

    worker.shutdown();
    drop(response_tx);

    // The writer ends once every in-flight handler has replied.
    match writer.await {
        Ok(result) => result,
        Err(err) => Err(AppError::Internal(format!("writer task failed: {err}"))),
    }
}
