//! Virtual filesystem view with a mount table.
//!
//! Virtual absolute paths map onto host directories through mounts. A mount
//! point holds at most one host directory at a time; mounting over a busy
//! point fails. Resolution normalizes `.` and `..`, rejects escapes above the
//! virtual root, and re-checks existing host targets after symlink
//! resolution so a link inside a mount cannot reach outside it.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Mount table plus working directory.
#[derive(Debug)]
pub struct Vfs {
    mounts: BTreeMap<String, PathBuf>,
    cwd: String,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Empty view rooted at `/`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mounts: BTreeMap::new(),
            cwd: "/".into(),
        }
    }

    /// Current working directory.
    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Whether `virtual_path` is currently a mount point.
    #[must_use]
    pub fn is_mounted(&self, virtual_path: &str) -> bool {
        normalize("/", virtual_path).is_ok_and(|p| self.mounts.contains_key(&p))
    }

    /// Expose `host` at `virtual_path`.
    ///
    /// # Errors
    ///
    /// - `AppError::Internal` if the mount point is busy or is `/`.
    /// - `AppError::Io` if `host` is not an existing directory.
    pub fn mount(&mut self, virtual_path: &str, host: &Path) -> Result<()> {
        let point = normalize("/", virtual_path)?;
        if point == "/" {
            return Err(AppError::Internal("cannot mount over the root".into()));
        }
        if self.mounts.contains_key(&point) {
            return Err(AppError::Internal(format!("mount point busy: {point}")));
        }
        let host = host
            .canonicalize()
            .map_err(|err| AppError::Io(format!("mount source {}: {err}", host.display())))?;
        if !host.is_dir() {
            return Err(AppError::Io(format!(
                "mount source is not a directory: {}",
                host.display()
            )));
        }
        self.mounts.insert(point, host);
        Ok(())
    }

    /// Remove the mount at `virtual_path`. A working directory inside the
    /// removed mount falls back to `/`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if nothing is mounted there.
    pub fn unmount(&mut self, virtual_path: &str) -> Result<()> {
        let point = normalize("/", virtual_path)?;
        if self.mounts.remove(&point).is_none() {
            return Err(AppError::Internal(format!("not mounted: {point}")));
        }
        if is_within(&self.cwd, &point) {
            self.cwd = "/".into();
        }
        Ok(())
    }

    /// Change the working directory.
    ///
    /// # Errors
    ///
    /// Fails if `path` is neither `/` nor an existing directory under a mount.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let target = normalize(&self.cwd, path)?;
        if target != "/" {
            let host = self.resolve(&target)?;
            if !host.is_dir() {
                return Err(AppError::NotFound(format!("directory {target}")));
            }
        }
        self.cwd = target;
        Ok(())
    }

    /// Map a virtual path onto its host location.
    ///
    /// # Errors
    ///
    /// - `AppError::PathTraversal` if the path escapes the root or a symlink
    ///   leads outside its mount.
    /// - `AppError::NotFound` if no mount covers the path.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let virtual_path = normalize(&self.cwd, path)?;
        let (point, host_root) = self
            .mounts
            .iter()
            .filter(|(point, _)| is_within(&virtual_path, point))
            .max_by_key(|(point, _)| point.len())
            .ok_or_else(|| AppError::NotFound(format!("no such file or directory: {virtual_path}")))?;

        let remainder = virtual_path[point.len()..].trim_start_matches('/');
        let host = if remainder.is_empty() {
            host_root.clone()
        } else {
            host_root.join(remainder)
        };

        if host.exists() {
            let canonical = host
                .canonicalize()
                .map_err(|err| AppError::Io(format!("cannot resolve {virtual_path}: {err}")))?;
            if !canonical.starts_with(host_root) {
                return Err(AppError::PathTraversal(format!(
                    "symlink target escapes mount: {virtual_path}"
                )));
            }
            return Ok(canonical);
        }
        Ok(host)
    }

    /// Read a file.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when the file is missing, otherwise resolution
    /// or I/O errors.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let host = self.resolve(path)?;
        if !host.is_file() {
            return Err(AppError::NotFound(format!("file {path}")));
        }
        fs::read(&host).map_err(|err| AppError::Io(format!("read {path}: {err}")))
    }

    /// Write a file atomically, creating parent directories inside the mount.
    ///
    /// # Errors
    ///
    /// Resolution or I/O errors.
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let host = self.resolve(path)?;
        let parent = host
            .parent()
            .ok_or_else(|| AppError::Io(format!("{path} has no parent directory")))?;
        fs::create_dir_all(parent)
            .map_err(|err| AppError::Io(format!("create parent of {path}: {err}")))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|err| AppError::Io(format!("create temporary file: {err}")))?;
        tmp.write_all(content)
            .map_err(|err| AppError::Io(format!("write temporary file: {err}")))?;
        tmp.persist(&host)
            .map_err(|err| AppError::Io(format!("persist {path}: {err}")))?;
        Ok(())
    }

    /// Whether `path` exists. Unmounted paths do not exist.
    ///
    /// # Errors
    ///
    /// `AppError::PathTraversal` for escaping paths.
    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.resolve(path) {
            Ok(host) => Ok(host.exists()),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Sorted entry names of a directory.
    ///
    /// # Errors
    ///
    /// Resolution or I/O errors.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let host = self.resolve(path)?;
        let mut names: Vec<String> = fs::read_dir(&host)
            .map_err(|err| AppError::Io(format!("list {path}: {err}")))?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Normalize `path` against `base` into an absolute virtual path.
///
/// # Errors
///
/// Returns `AppError::PathTraversal` if `..` climbs above `/`.
pub fn normalize(base: &str, path: &str) -> Result<String> {
    let joined = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{base}/{path}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(AppError::PathTraversal(format!(
                        "path escapes the filesystem root: {path}"
                    )));
                }
            }
            other => parts.push(other),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Whether virtual `path` equals `root` or lies beneath it.
#[must_use]
pub fn is_within(path: &str, root: &str) -> bool {
    if root == "/" {
        return true;
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}
