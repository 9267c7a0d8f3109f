//! Interpreter capability surface consumed by the worker.
//!
//! The worker core never talks to a concrete interpreter; it drives a
//! [`SandboxEngine`]. The bundled implementation is [`rhai_engine::RhaiEngine`].

pub mod rhai_engine;
pub mod vfs;

use std::path::Path;

use crate::models::task::ExecutionOutput;
use crate::Result;

/// Opaque handle naming one interpreter global state.
pub type StateHandle = u64;

/// Operations a sandboxed interpreter must provide.
///
/// Path arguments are virtual paths in the engine's own filesystem view;
/// only [`mount`](Self::mount) names a host path.
pub trait SandboxEngine {
    /// Prepare the interpreter. Called once before anything else.
    ///
    /// # Errors
    ///
    /// Returns an error if the interpreter cannot start.
    fn initialize(&mut self) -> Result<()>;

    /// Enable named capability bundles.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unknown extension name.
    fn load_extensions(&mut self, names: &[String]) -> Result<()>;

    /// Allocate a fresh, empty global state.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is not initialized.
    fn new_global_state(&mut self) -> Result<StateHandle>;

    /// Release a global state. Unknown handles are ignored.
    fn destroy_global_state(&mut self, handle: StateHandle);

    /// Evaluate `code` against the state behind `handle`.
    ///
    /// Interpreter failures are reported inside the returned
    /// [`ExecutionOutput`]; the `Err` side is reserved for infrastructure
    /// problems such as an unknown handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    fn run(&mut self, code: &str, handle: StateHandle) -> Result<ExecutionOutput>;

    /// Expose `host_path` at `virtual_path`.
    ///
    /// # Errors
    ///
    /// Fails if the mount point is already in use or the host path is unusable.
    fn mount(&mut self, virtual_path: &str, host_path: &Path) -> Result<()>;

    /// Remove the mount at `virtual_path`.
    ///
    /// # Errors
    ///
    /// Fails if nothing is mounted there.
    fn unmount(&mut self, virtual_path: &str) -> Result<()>;

    /// Change the interpreter's working directory.
    ///
    /// # Errors
    ///
    /// Fails if `path` is not a directory in the filesystem view.
    fn chdir(&mut self, path: &str) -> Result<()>;

    /// Read a file through the filesystem view.
    ///
    /// # Errors
    ///
    /// Fails if the path does not resolve or cannot be read.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Write a file through the filesystem view.
    ///
    /// # Errors
    ///
    /// Fails if the path does not resolve or cannot be written.
    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<()>;

    /// Whether a path exists in the filesystem view.
    ///
    /// # Errors
    ///
    /// Fails if the path escapes the view.
    fn exists(&self, path: &str) -> Result<bool>;
}
