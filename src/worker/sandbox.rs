//! Per-session workspace directories and the caller-path guards.
//!
//! Guards run before any filesystem access: a rejected filename or download
//! path never touches the disk.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::worker::engine::vfs::{is_within, normalize};
use crate::{AppError, Result};

/// Virtual path at which the active session's workspace is mounted.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Virtual path of the worker's shared scratch directory.
pub const SCRATCH_MOUNT: &str = "/tmp";

/// Reject upload filenames containing path separators or relative segments.
///
/// # Errors
///
/// Returns `AppError::Validation` if the name is empty, equals `.` or `..`,
/// or contains `/`, `\` or NUL.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AppError::Validation("filename must not be empty".into()));
    }
    if name == "." || name == ".." {
        return Err(AppError::Validation(format!("invalid filename: {name}")));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(AppError::Validation(format!(
            "filename must not contain path separators: {name}"
        )));
    }
    Ok(())
}

/// Resolve a caller-supplied download path against the workspace mount.
///
/// Relative paths are joined onto [`WORKSPACE_MOUNT`]; absolute paths are
/// taken as-is. Either way the normalized result must stay inside it.
///
/// # Errors
///
/// Returns `AppError::PathTraversal` when the path leaves the workspace and
/// `AppError::Validation` when it names the workspace itself.
pub fn resolve_download_path(path: &str) -> Result<String> {
    let resolved = normalize(WORKSPACE_MOUNT, path).map_err(|_| {
        AppError::PathTraversal(format!("path escapes session root: {path}"))
    })?;
    if !is_within(&resolved, WORKSPACE_MOUNT) {
        return Err(AppError::PathTraversal(format!(
            "path escapes session root: {path}"
        )));
    }
    if resolved == WORKSPACE_MOUNT {
        return Err(AppError::Validation("path must name a file".into()));
    }
    Ok(resolved)
}

/// Host directory owned by one session, removed when released.
#[derive(Debug)]
pub struct SessionWorkspace {
    dir: TempDir,
}

impl SessionWorkspace {
    /// Create a fresh directory for `session_id` under `parent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn create(parent: &Path, session_id: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("session-{session_id}-"))
            .tempdir_in(parent)
            .map_err(|err| AppError::Io(format!("create session workspace: {err}")))?;
        Ok(Self { dir })
    }

    /// Host path of the workspace.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Owned copy of the host path.
    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Delete the workspace and everything in it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if removal fails.
    pub fn remove(self) -> Result<()> {
        self.dir
            .close()
            .map_err(|err| AppError::Io(format!("remove session workspace: {err}")))
    }
}
