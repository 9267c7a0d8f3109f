//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Per-worker session cache bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Maximum live sessions per worker before LRU eviction.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Lifetime of a session, counted from creation.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Interval between expired-session sweeps inside a worker.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_seconds: default_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Deadlines enforced by the scheduler.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Default deadline for `execute_code` when the caller gives none.
    #[serde(default = "default_execute_ms")]
    pub execute_ms: u64,
    /// Deadline for create/upload/download tasks; 0 means no deadline.
    #[serde(default)]
    pub file_ms: u64,
    /// Time a freshly spawned worker has to report readiness.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Delay before retrying a worker launch that failed outright.
    #[serde(default = "default_respawn_backoff_ms")]
    pub respawn_backoff_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            execute_ms: default_execute_ms(),
            file_ms: 0,
            startup_seconds: default_startup_seconds(),
            respawn_backoff_ms: default_respawn_backoff_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Default execution deadline.
    #[must_use]
    pub fn execute(&self) -> Duration {
        Duration::from_millis(self.execute_ms)
    }

    /// Deadline for file and session-creation tasks, if any.
    #[must_use]
    pub fn file(&self) -> Option<Duration> {
        (self.file_ms > 0).then(|| Duration::from_millis(self.file_ms))
    }

    /// Worker readiness window.
    #[must_use]
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_seconds)
    }

    /// Respawn delay after a failed launch.
    #[must_use]
    pub fn respawn_backoff(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_http_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_extensions() -> Vec<String> {
    vec!["fs".into(), "time".into()]
}

fn default_capacity() -> usize {
    100
}

fn default_ttl_seconds() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_execute_ms() -> u64 {
    15_000
}

fn default_startup_seconds() -> u64 {
    30
}

fn default_respawn_backoff_ms() -> u64 {
    500
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Number of worker slots.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// HTTP listen port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// HTTP listen address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Host directory holding every worker's sandbox.
    pub workspace_root: PathBuf,
    /// Worker executable; defaults to `sandpool-worker` next to the server binary.
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
    /// Interpreter extensions loaded by each worker.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Largest accepted upload body in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Session cache bounds.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Scheduler deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the worker executable path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no path is configured and the server's
    /// own executable location cannot be determined.
    pub fn worker_binary(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.worker_binary {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|err| AppError::Config(format!("cannot locate server binary: {err}")))?;
        let dir = exe
            .parent()
            .ok_or_else(|| AppError::Config("server binary has no parent directory".into()))?;
        Ok(dir.join(format!("sandpool-worker{}", std::env::consts::EXE_SUFFIX)))
    }

    /// Re-run validation after programmatic overrides (e.g. CLI flags).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a value is out of range.
    pub fn validate(&mut self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(AppError::Config("pool_size must be greater than zero".into()));
        }
        if self.sessions.capacity == 0 {
            return Err(AppError::Config(
                "sessions.capacity must be greater than zero".into(),
            ));
        }
        if self.sessions.ttl_seconds == 0 {
            return Err(AppError::Config(
                "sessions.ttl_seconds must be greater than zero".into(),
            ));
        }
        if self.sessions.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "sessions.sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.timeouts.execute_ms == 0 {
            return Err(AppError::Config(
                "timeouts.execute_ms must be greater than zero".into(),
            ));
        }
        if self.timeouts.startup_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.startup_seconds must be greater than zero".into(),
            ));
        }

        fs::create_dir_all(&self.workspace_root)
            .map_err(|err| AppError::Config(format!("workspace_root unusable: {err}")))?;
        self.workspace_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;

        Ok(())
    }
}
