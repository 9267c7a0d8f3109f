//! Error types shared across the scheduler, the worker and the HTTP surface.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Session unknown on the worker asked, or requested file missing.
    NotFound(String),
    /// Task deadline exceeded; the owning slot was replaced.
    Timeout(String),
    /// Worker process died or exited; all of its work was rejected.
    WorkerCrash(String),
    /// Malformed filename or request shape.
    Validation(String),
    /// Resolved path escapes the session sandbox root.
    PathTraversal(String),
    /// Uncaught interpreter or infrastructure error.
    Internal(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Scheduler/worker wire protocol failure.
    Protocol(String),
}

/// Machine-readable classification carried on the wire and in HTTP bodies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`AppError::NotFound`].
    NotFound,
    /// See [`AppError::Timeout`].
    Timeout,
    /// See [`AppError::WorkerCrash`].
    WorkerCrash,
    /// See [`AppError::Validation`].
    Validation,
    /// See [`AppError::PathTraversal`].
    PathTraversal,
    /// Everything else.
    Internal,
}

impl AppError {
    /// Classification of this error for transport.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::WorkerCrash(_) => ErrorKind::WorkerCrash,
            Self::Validation(_) => ErrorKind::Validation,
            Self::PathTraversal(_) => ErrorKind::PathTraversal,
            Self::Internal(_) | Self::Config(_) | Self::Io(_) | Self::Protocol(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The bare message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::Timeout(msg)
            | Self::WorkerCrash(msg)
            | Self::Validation(msg)
            | Self::PathTraversal(msg)
            | Self::Internal(msg)
            | Self::Config(msg)
            | Self::Io(msg)
            | Self::Protocol(msg) => msg,
        }
    }

    /// Rebuild an error from its transported kind and message.
    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::WorkerCrash => Self::WorkerCrash(message),
            ErrorKind::Validation => Self::Validation(message),
            ErrorKind::PathTraversal => Self::PathTraversal(message),
            ErrorKind::Internal => Self::Internal(message),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::WorkerCrash(msg) => write!(f, "worker crash: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::PathTraversal(msg) => write!(f, "path traversal: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}
