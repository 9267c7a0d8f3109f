//! Scheduler behaviour against an in-process fake launcher.
//!
//! The fake worker answers `execute_code` with the code echoed back as the
//! result and its own identity as stdout, so tests can tell which worker
//! incarnation served a task. Special snippets:
//! - `hang`: never answer.
//! - `sleep:N`: answer after N ms.
//! - `late:N`: answer after N ms even if the worker was terminated.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sandpool::errors::ErrorKind;
use sandpool::models::worker::{WorkerIdentity, WorkerStatus};
use sandpool::protocol::{SuccessPayload, WorkerRequest, WorkerResponse};
use sandpool::scheduler::launcher::{SlotEvent, WorkerEvent, WorkerLauncher, WorkerLink};
use sandpool::scheduler::monitor::SchedulerSettings;
use sandpool::scheduler::pool::{PoolSettings, SessionPool};
use sandpool::{AppError, Result};

// ── Fake launcher ────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeLauncher {
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    silent_launches: AtomicUsize,
    current: Mutex<HashMap<usize, (WorkerIdentity, mpsc::Sender<SlotEvent>)>>,
    served: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn served(&self) -> Vec<String> {
        self.served.lock().expect("served lock").clone()
    }

    /// Report the current worker of `slot` as exited.
    async fn kill(&self, slot: usize) {
        let (identity, events) = self
            .current
            .lock()
            .expect("current lock")
            .get(&slot)
            .cloned()
            .expect("slot has a worker");
        events
            .send(SlotEvent {
                slot,
                identity,
                event: WorkerEvent::Exited {
                    code: Some(137),
                    reason: "process terminated by test".into(),
                },
            })
            .await
            .expect("scheduler alive");
    }
}

struct FakeLink {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    cancel: CancellationToken,
}

impl WorkerLink for FakeLink {
    fn send(&self, request: WorkerRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| AppError::WorkerCrash("fake closed".into()))
    }

    fn terminate(&mut self) {
        self.cancel.cancel();
    }
}

fn decrement(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl WorkerLauncher for FakeLauncher {
    fn launch(
        &self,
        slot: usize,
        identity: WorkerIdentity,
        events: mpsc::Sender<SlotEvent>,
    ) -> Result<Box<dyn WorkerLink>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if decrement(&self.failing_launches) {
            return Err(AppError::WorkerCrash("fake launch failure".into()));
        }
        let announce = !decrement(&self.silent_launches);

        self.current
            .lock()
            .expect("current lock")
            .insert(slot, (identity.clone(), events.clone()));

        let (requests, mut rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let served = Arc::clone(&self.served);

        tokio::spawn(async move {
            let emit = |event: WorkerEvent| SlotEvent {
                slot,
                identity: identity.clone(),
                event,
            };
            if announce {
                let ready = WorkerResponse::Ready {
                    identity: identity.clone(),
                };
                let _ = events.send(emit(WorkerEvent::Message(ready))).await;
            }
            loop {
                let request = tokio::select! {
                    () = worker_cancel.cancelled() => return,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => return,
                    },
                };
                let task_id = request.task_id().to_owned();
                let payload = match request {
                    WorkerRequest::CreateSession { session_id, .. } => {
                        SuccessPayload::SessionCreated { session_id }
                    }
                    WorkerRequest::UploadFile { filename, .. } => {
                        SuccessPayload::FileUploaded { filename }
                    }
                    WorkerRequest::DownloadFile { path, .. } => {
                        let error = WorkerResponse::Error {
                            task_id,
                            kind: Some(ErrorKind::NotFound),
                            message: format!("file {path}"),
                        };
                        let _ = events.send(emit(WorkerEvent::Message(error))).await;
                        continue;
                    }
                    WorkerRequest::ExecuteCode { code, .. } => {
                        if code == "hang" {
                            continue;
                        }
                        if let Some(ms) = code.strip_prefix("late:") {
                            let delay = Duration::from_millis(ms.parse().expect("ms"));
                            let late_events = events.clone();
                            let late = emit(WorkerEvent::Message(WorkerResponse::Success {
                                task_id,
                                payload: SuccessPayload::Executed {
                                    result: json!(code),
                                    stdout: identity.to_string(),
                                    error: None,
                                },
                            }));
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = late_events.send(late).await;
                            });
                            continue;
                        }
                        if let Some(ms) = code.strip_prefix("sleep:") {
                            let delay = Duration::from_millis(ms.parse().expect("ms"));
                            tokio::time::sleep(delay).await;
                        }
                        served.lock().expect("served lock").push(code.clone());
                        SuccessPayload::Executed {
                            result: json!(code),
                            stdout: identity.to_string(),
                            error: None,
                        }
                    }
                };
                let success = WorkerResponse::Success { task_id, payload };
                let _ = events.send(emit(WorkerEvent::Message(success))).await;
            }
        });

        Ok(Box::new(FakeLink { requests, cancel }))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn settings(pool_size: usize) -> PoolSettings {
    PoolSettings {
        pool_size: NonZeroUsize::new(pool_size).expect("non-zero"),
        scheduler: SchedulerSettings {
            startup_timeout: Duration::from_millis(200),
            respawn_backoff: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(10),
        },
        execute_timeout: Duration::from_secs(5),
        file_timeout: None,
    }
}

fn start(pool_size: usize, launcher: &Arc<FakeLauncher>) -> (SessionPool, CancellationToken) {
    let cancel = CancellationToken::new();
    let dyn_launcher: Arc<dyn WorkerLauncher> = launcher.clone();
    let (pool, _actor) = SessionPool::start(settings(pool_size), dyn_launcher, cancel.clone());
    (pool, cancel)
}

/// A session id that routes to `slot`.
fn session_on(pool: &SessionPool, slot: usize) -> String {
    (0..10_000)
        .map(|i| format!("session-{i}"))
        .find(|id| pool.slot_for(id) == slot)
        .expect("some id routes to the slot")
}

async fn wait_ready(pool: &SessionPool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let slots = pool.snapshot().await.expect("snapshot");
            if slots.iter().all(|s| s.status == WorkerStatus::Ready) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all slots ready in time");
}

async fn identity_of(pool: &SessionPool, slot: usize) -> WorkerIdentity {
    pool.snapshot().await.expect("snapshot")[slot]
        .worker
        .clone()
        .expect("slot has a worker")
}

// ── Ordering ─────────────────────────────────────────────────────────────────

/// Tasks for one slot run in arrival order, across different sessions.
#[tokio::test]
async fn same_slot_tasks_run_in_arrival_order() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(1, &launcher);

    let codes = ["sleep:30", "b", "sleep:5", "d", "e"];
    let handles: Vec<_> = codes
        .iter()
        .enumerate()
        .map(|(i, code)| {
            let pool = pool.clone();
            let code = (*code).to_owned();
            tokio::spawn(async move {
                pool.execute_code(&format!("session-{i}"), &code, None).await
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("join").expect("execute");
    }
    assert_eq!(launcher.served(), codes.to_vec());
}

// ── Crash containment ────────────────────────────────────────────────────────

/// A dead worker takes its active and queued tasks with it; another slot
/// keeps serving.
#[tokio::test]
async fn crash_rejects_only_the_failed_slot() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(2, &launcher);
    wait_ready(&pool).await;

    let on_zero = session_on(&pool, 0);
    let on_one = session_on(&pool, 1);
    let before = identity_of(&pool, 0).await;

    let active = {
        let pool = pool.clone();
        let id = on_zero.clone();
        tokio::spawn(async move { pool.execute_code(&id, "hang", None).await })
    };
    let queued = {
        let pool = pool.clone();
        let id = on_zero.clone();
        tokio::spawn(async move { pool.execute_code(&id, "next", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    launcher.kill(0).await;

    let active = active.await.expect("join").expect_err("active rejected");
    assert!(matches!(active, AppError::WorkerCrash(_)), "{active:?}");
    let queued = queued.await.expect("join").expect_err("queued rejected");
    assert!(
        matches!(queued, AppError::WorkerCrash(ref msg) if msg.contains("before dispatch")),
        "{queued:?}"
    );

    let other = pool
        .execute_code(&on_one, "fine", None)
        .await
        .expect("other slot unaffected");
    assert_eq!(other.result, json!("fine"));

    let after = pool
        .execute_code(&on_zero, "again", None)
        .await
        .expect("replacement serves");
    assert_ne!(after.stdout, before.to_string(), "new incarnation expected");
    assert_eq!(launcher.launch_count(), 3);
}

// ── Timeouts ─────────────────────────────────────────────────────────────────

/// A stuck task times out and the next task on the slot meets a new worker.
#[tokio::test]
async fn timeout_replaces_the_worker() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(1, &launcher);
    wait_ready(&pool).await;
    let before = identity_of(&pool, 0).await;

    let err = pool
        .execute_code("s", "hang", Some(Duration::from_millis(50)))
        .await
        .expect_err("must time out");
    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let next = pool.execute_code("s", "after", None).await.expect("served");
    assert_eq!(next.result, json!("after"));
    assert_ne!(next.stdout, before.to_string());
}

/// A reply arriving after its deadline never reaches any caller.
#[tokio::test]
async fn late_reply_after_timeout_is_discarded() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(1, &launcher);
    wait_ready(&pool).await;

    let err = pool
        .execute_code("s", "late:150", Some(Duration::from_millis(30)))
        .await
        .expect_err("must time out");
    assert!(matches!(err, AppError::Timeout(_)));

    let slow = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_code("s", "sleep:250", None).await })
    };
    let output = slow.await.expect("join").expect("served");
    assert_eq!(output.result, json!("sleep:250"), "stale reply leaked");

    let last = pool.execute_code("s", "last", None).await.expect("served");
    assert_eq!(last.result, json!("last"));
}

// ── Startup and launch failures ──────────────────────────────────────────────

#[tokio::test]
async fn failed_launch_is_retried_after_backoff() {
    let launcher = Arc::new(FakeLauncher::default());
    launcher.failing_launches.store(1, Ordering::SeqCst);
    let (pool, _cancel) = start(1, &launcher);

    let output = pool.execute_code("s", "ok", None).await.expect("served");
    assert_eq!(output.result, json!("ok"));
    assert_eq!(launcher.launch_count(), 2);
}

/// A worker that never reports ready is replaced; work queued behind it
/// is rejected.
#[tokio::test]
async fn silent_worker_hits_startup_deadline() {
    let launcher = Arc::new(FakeLauncher::default());
    launcher.silent_launches.store(1, Ordering::SeqCst);
    let (pool, _cancel) = start(1, &launcher);

    let err = pool
        .execute_code("s", "early", None)
        .await
        .expect_err("queued behind silent worker");
    assert!(matches!(err, AppError::WorkerCrash(_)), "{err:?}");

    let output = pool.execute_code("s", "later", None).await.expect("served");
    assert_eq!(output.result, json!("later"));
    assert_eq!(launcher.launch_count(), 2);
}

// ── Results and errors ───────────────────────────────────────────────────────

#[tokio::test]
async fn worker_errors_keep_their_kind() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(2, &launcher);

    let err = pool
        .download_file("s", "missing.txt")
        .await
        .expect_err("fake reports not found");
    assert!(matches!(err, AppError::NotFound(ref msg) if msg.contains("missing.txt")));
}

#[tokio::test]
async fn create_and_upload_return_payloads() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(3, &launcher);

    let id = pool.create_session().await.expect("create");
    assert!(!id.is_empty());
    let name = pool
        .upload_file(&id, "a.txt", b"data".to_vec())
        .await
        .expect("upload");
    assert_eq!(name, "a.txt");
}

#[tokio::test]
async fn snapshot_lists_every_slot() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, _cancel) = start(3, &launcher);
    wait_ready(&pool).await;

    let slots = pool.snapshot().await.expect("snapshot");
    assert_eq!(slots.len(), 3);
    for (i, slot) in slots.iter().enumerate() {
        assert_eq!(slot.index, i);
        assert!(slot.worker.is_some());
        assert_eq!(slot.queued, 0);
        assert!(!slot.busy);
    }
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_rejects_outstanding_work() {
    let launcher = Arc::new(FakeLauncher::default());
    let (pool, cancel) = start(1, &launcher);
    wait_ready(&pool).await;

    let stuck = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_code("s", "hang", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let err = stuck.await.expect("join").expect_err("rejected");
    assert!(matches!(err, AppError::Internal(ref msg) if msg.contains("shutting down")));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = pool.create_session().await.expect_err("pool gone");
    assert!(matches!(err, AppError::Internal(_)));
}
