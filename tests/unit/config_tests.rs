//! Unit tests for configuration parsing and validation.

use std::time::Duration;

use sandpool::{config::GlobalConfig, AppError};

fn full_toml(workspace: &str) -> String {
    format!(
        r#"
pool_size = 3
http_port = 8080
bind_address = "0.0.0.0"
workspace_root = '{workspace}'
worker_binary = "/opt/sandpool/sandpool-worker"
extensions = ["fs"]
max_upload_bytes = 1024

[sessions]
capacity = 10
ttl_seconds = 60
sweep_interval_seconds = 5

[timeouts]
execute_ms = 2000
file_ms = 500
startup_seconds = 3
respawn_backoff_ms = 50
"#
    )
}

#[test]
fn parses_full_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config =
        GlobalConfig::from_toml_str(&full_toml(&temp.path().to_string_lossy())).expect("valid");

    assert_eq!(config.pool_size, 3);
    assert_eq!(config.http_port, 8080);
    assert_eq!(config.bind_address, "0.0.0.0");
    assert_eq!(config.extensions, vec!["fs".to_owned()]);
    assert_eq!(config.max_upload_bytes, 1024);
    assert_eq!(config.sessions.capacity, 10);
    assert_eq!(config.timeouts.execute(), Duration::from_millis(2000));
    assert_eq!(config.timeouts.file(), Some(Duration::from_millis(500)));
    assert_eq!(config.timeouts.startup(), Duration::from_secs(3));
    assert_eq!(
        config.worker_binary().expect("binary"),
        std::path::PathBuf::from("/opt/sandpool/sandpool-worker")
    );
}

#[test]
fn minimal_config_uses_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!("workspace_root = '{}'", temp.path().to_string_lossy());
    let config = GlobalConfig::from_toml_str(&raw).expect("valid");

    assert_eq!(config.pool_size, 4);
    assert_eq!(config.http_port, 3000);
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.extensions, vec!["fs".to_owned(), "time".to_owned()]);
    assert_eq!(config.sessions.capacity, 100);
    assert_eq!(config.sessions.ttl_seconds, 3600);
    assert_eq!(config.timeouts.execute_ms, 15_000);
    assert_eq!(config.timeouts.file(), None);
    assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
}

#[test]
fn workspace_root_is_created_and_canonicalized() {
    let temp = tempfile::tempdir().expect("tempdir");
    let nested = temp.path().join("a").join("b");
    let raw = format!("workspace_root = '{}'", nested.to_string_lossy());
    let config = GlobalConfig::from_toml_str(&raw).expect("valid");

    assert!(nested.is_dir());
    assert_eq!(config.workspace_root, nested.canonicalize().expect("canonical"));
}

#[test]
fn rejects_zero_pool_size() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "pool_size = 0\nworkspace_root = '{}'",
        temp.path().to_string_lossy()
    );
    let err = GlobalConfig::from_toml_str(&raw).expect_err("zero pool");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("pool_size")));
}

#[test]
fn rejects_zero_capacity() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "workspace_root = '{}'\n[sessions]\ncapacity = 0",
        temp.path().to_string_lossy()
    );
    let err = GlobalConfig::from_toml_str(&raw).expect_err("zero capacity");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("capacity")));
}

#[test]
fn missing_workspace_root_is_config_error() {
    let err = GlobalConfig::from_toml_str("pool_size = 2").expect_err("missing root");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn default_worker_binary_sits_next_to_current_exe() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!("workspace_root = '{}'", temp.path().to_string_lossy());
    let config = GlobalConfig::from_toml_str(&raw).expect("valid");

    let binary = config.worker_binary().expect("binary path");
    let exe = std::env::current_exe().expect("current exe");
    assert_eq!(binary.parent(), exe.parent());
    assert!(binary
        .file_name()
        .expect("file name")
        .to_string_lossy()
        .starts_with("sandpool-worker"));
}
