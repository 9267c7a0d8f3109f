//! Routed units of work and their outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
pub type TaskId = String;

/// The four logical operations a caller can issue against a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Materialize a new session on its home worker.
    CreateSession,
    /// Write a file into the session workspace.
    UploadFile,
    /// Run a snippet against the session interpreter state.
    ExecuteCode,
    /// Read a file back out of the session workspace.
    DownloadFile,
}

/// Kind-specific request data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// No payload; the session id is pre-generated by the scheduler.
    CreateSession,
    /// Bare filename plus file content.
    UploadFile {
        /// Target filename; must not contain a path separator.
        filename: String,
        /// Raw file bytes.
        content: Vec<u8>,
    },
    /// Source snippet.
    ExecuteCode {
        /// Code to evaluate.
        code: String,
    },
    /// Path relative to the session workspace.
    DownloadFile {
        /// Caller-supplied relative path.
        path: String,
    },
}

impl TaskPayload {
    /// Kind tag for this payload.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::CreateSession => TaskKind::CreateSession,
            Self::UploadFile { .. } => TaskKind::UploadFile,
            Self::ExecuteCode { .. } => TaskKind::ExecuteCode,
            Self::DownloadFile { .. } => TaskKind::DownloadFile,
        }
    }
}

/// One routed unit of work. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Session addressed; determines the slot.
    pub session_id: String,
    /// Kind-specific data.
    pub payload: TaskPayload,
    /// Deadline measured from dispatch, if any.
    pub timeout: Option<Duration>,
    /// When the task entered the scheduler.
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    /// Construct a task with a generated identifier.
    #[must_use]
    pub fn new(session_id: String, payload: TaskPayload, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            payload,
            timeout,
            enqueued_at: Utc::now(),
        }
    }

    /// Kind tag for this task.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// Result of running a snippet.
///
/// Interpreter-level failures are reported through `error` so that output
/// printed before the failure is not lost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutput {
    /// Evaluated value converted to JSON; `null` on failure or unit.
    pub result: serde_json::Value,
    /// Captured `print`/`debug` output.
    pub stdout: String,
    /// Interpreter error message, if evaluation failed.
    pub error: Option<String>,
}

/// Kind-specific success value delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Identifier of the new session.
    SessionCreated(String),
    /// Name of the stored file.
    FileUploaded(String),
    /// Snippet outcome.
    Executed(ExecutionOutput),
    /// Raw file bytes.
    FileDownloaded(Vec<u8>),
}
