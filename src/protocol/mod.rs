//! Scheduler ↔ worker wire protocol.
//!
//! Messages travel as newline-delimited JSON over the worker's stdio.
//! Each request carries a `task_id`; the worker answers every accepted
//! request with exactly one `success` or `error` line carrying the same id.
//! The first line a worker emits is `ready`.
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing.
//! - `reader`: async task turning inbound lines into typed messages.
//! - `writer`: async task serialising outbound messages.

pub mod codec;
pub mod reader;
pub mod writer;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::models::task::{ExecutionOutput, Task, TaskId, TaskOutput, TaskPayload};
use crate::models::worker::WorkerIdentity;

/// Scheduler → worker request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Create interpreter state and workspace for `session_id`.
    CreateSession {
        /// Correlation id.
        task_id: TaskId,
        /// Pre-generated session id.
        session_id: String,
    },
    /// Store a file in the session workspace.
    UploadFile {
        /// Correlation id.
        task_id: TaskId,
        /// Target session.
        session_id: String,
        /// Bare filename.
        filename: String,
        /// File bytes, base64 on the wire.
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    /// Evaluate a snippet.
    ExecuteCode {
        /// Correlation id.
        task_id: TaskId,
        /// Target session.
        session_id: String,
        /// Source code.
        code: String,
    },
    /// Read a workspace file.
    DownloadFile {
        /// Correlation id.
        task_id: TaskId,
        /// Target session.
        session_id: String,
        /// Path relative to the workspace root.
        path: String,
    },
}

impl WorkerRequest {
    /// Correlation id of this request.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::CreateSession { task_id, .. }
            | Self::UploadFile { task_id, .. }
            | Self::ExecuteCode { task_id, .. }
            | Self::DownloadFile { task_id, .. } => task_id,
        }
    }

    /// Session addressed by this request.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::CreateSession { session_id, .. }
            | Self::UploadFile { session_id, .. }
            | Self::ExecuteCode { session_id, .. }
            | Self::DownloadFile { session_id, .. } => session_id,
        }
    }
}

impl From<&Task> for WorkerRequest {
    fn from(task: &Task) -> Self {
        let task_id = task.id.clone();
        let session_id = task.session_id.clone();
        match task.payload {
            TaskPayload::CreateSession => Self::CreateSession {
                task_id,
                session_id,
            },
            TaskPayload::UploadFile {
                ref filename,
                ref content,
            } => Self::UploadFile {
                task_id,
                session_id,
                filename: filename.clone(),
                content: content.clone(),
            },
            TaskPayload::ExecuteCode { ref code } => Self::ExecuteCode {
                task_id,
                session_id,
                code: code.clone(),
            },
            TaskPayload::DownloadFile { ref path } => Self::DownloadFile {
                task_id,
                session_id,
                path: path.clone(),
            },
        }
    }
}

/// Kind-specific success value as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuccessPayload {
    /// Session registered in the worker cache.
    SessionCreated {
        /// The created session id.
        session_id: String,
    },
    /// File stored.
    FileUploaded {
        /// Stored filename.
        filename: String,
    },
    /// Snippet evaluated.
    Executed {
        /// Evaluated value.
        result: serde_json::Value,
        /// Captured output.
        stdout: String,
        /// Interpreter error, if any.
        error: Option<String>,
    },
    /// File read.
    FileDownloaded {
        /// File bytes, base64 on the wire.
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
}

impl From<SuccessPayload> for TaskOutput {
    fn from(payload: SuccessPayload) -> Self {
        match payload {
            SuccessPayload::SessionCreated { session_id } => Self::SessionCreated(session_id),
            SuccessPayload::FileUploaded { filename } => Self::FileUploaded(filename),
            SuccessPayload::Executed {
                result,
                stdout,
                error,
            } => Self::Executed(ExecutionOutput {
                result,
                stdout,
                error,
            }),
            SuccessPayload::FileDownloaded { content } => Self::FileDownloaded(content),
        }
    }
}

/// Worker → scheduler message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Interpreter and base sandbox initialized.
    Ready {
        /// Identity the worker was launched with.
        identity: WorkerIdentity,
    },
    /// Task completed.
    Success {
        /// Correlation id.
        task_id: TaskId,
        /// Kind-specific value.
        payload: SuccessPayload,
    },
    /// Task failed inside the worker.
    Error {
        /// Correlation id.
        task_id: TaskId,
        /// Structured classification, when the worker provides one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        /// Human-readable cause.
        message: String,
    },
}

/// Serde adapter storing byte vectors as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
