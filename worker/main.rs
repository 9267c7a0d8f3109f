#![forbid(unsafe_code)]

//! `sandpool-worker`: one sandboxed interpreter speaking NDJSON on stdio.
//!
//! Launched by the `sandpool` scheduler; not meant to be run by hand.
//! stdout carries protocol messages only, so all logging goes to stderr.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use sandpool::models::worker::WorkerIdentity;
use sandpool::worker::engine::rhai_engine::RhaiEngine;
use sandpool::worker::runtime::{self, Worker, WorkerSettings};
use sandpool::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "sandpool-worker", about = "Sandpool interpreter worker", version, long_about = None)]
struct Cli {
    /// Slot index served by this worker.
    #[arg(long)]
    slot: usize,

    /// Identity assigned by the scheduler.
    #[arg(long)]
    identity: String,

    /// Directory holding this slot's sandboxes.
    #[arg(long)]
    sandbox_root: PathBuf,

    /// Maximum live sessions.
    #[arg(long, default_value_t = 100)]
    capacity: usize,

    /// Session lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    ttl_seconds: u64,

    /// Expired-session sweep period in seconds.
    #[arg(long, default_value_t = 60)]
    sweep_seconds: u64,

    /// Comma-separated interpreter extensions.
    #[arg(long, value_delimiter = ',', default_value = "fs,time")]
    extensions: Vec<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(args)).map_err(|err| {
        error!(%err, "worker failed");
        err
    })
}

async fn run(args: Cli) -> Result<()> {
    let settings = WorkerSettings {
        slot: args.slot,
        identity: WorkerIdentity::from(args.identity),
        sandbox_root: args.sandbox_root,
        capacity: args.capacity.max(1),
        ttl: Duration::from_secs(args.ttl_seconds.max(1)),
        sweep_interval: Duration::from_secs(args.sweep_seconds.max(1)),
        extensions: args
            .extensions
            .into_iter()
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect(),
    };

    let worker = Worker::initialize(settings, RhaiEngine::new())?;
    info!(slot = args.slot, worker = %worker.identity(), "worker serving on stdio");

    runtime::serve(
        worker,
        tokio::io::stdin(),
        tokio::io::stdout(),
        CancellationToken::new(),
    )
    .await
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

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
