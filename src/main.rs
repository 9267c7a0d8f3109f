#![forbid(unsafe_code)]

//! `sandpool`: stateful code-execution sessions over a worker pool.
//!
//! Loads configuration, starts one `sandpool-worker` process per slot and
//! serves the HTTP API until SIGINT/SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use sandpool::api::http;
use sandpool::config::GlobalConfig;
use sandpool::scheduler::pool::SessionPool;
use sandpool::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "sandpool", about = "Sandboxed code-execution session pool", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the number of worker slots.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Override the HTTP listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("sandpool server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    config.validate()?;
    info!(
        pool_size = config.pool_size,
        workspace_root = %config.workspace_root.display(),
        "configuration loaded"
    );

    // ── Start the pool ──────────────────────────────────
    let ct = CancellationToken::new();
    let (pool, scheduler_handle) = SessionPool::from_config(&config, ct.clone())?;

    // ── Start HTTP ──────────────────────────────────────
    let ip: IpAddr = config
        .bind_address
        .parse()
        .map_err(|err| AppError::Config(format!("invalid bind_address: {err}")))?;
    let addr = SocketAddr::new(ip, config.http_port);
    let app = http::router(pool, config.max_upload_bytes);
    let http_ct = ct.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(addr, app, http_ct.clone()).await {
            error!(%err, "HTTP server failed");
            http_ct.cancel();
        }
    });

    info!(%addr, "sandpool ready");

    // ── Wait for shutdown ───────────────────────────────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        () = ct.cancelled() => {}
    }
    ct.cancel();

    let _ = tokio::join!(http_handle, scheduler_handle);
    info!("sandpool shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
